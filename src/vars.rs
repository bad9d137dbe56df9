/// Insertion-ordered list of `name=value` pairs.
///
/// Overwriting a name removes the old pair and appends a new one, so
/// enumeration order always reflects the most recent assignment.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    entries: Vec<(String, String)>,
}

/// Returned by [`VariableStore::unset`] when the name is not defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound;

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    pub fn unset(&mut self, name: &str) -> Result<(), NotFound> {
        let pos = self
            .entries
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(NotFound)?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Removes `name` and hands back its value. Used when promoting a
    /// variable into the environment.
    pub fn take(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Calls `f` for every pair in insertion order.
    ///
    /// Stops at the first non-zero result and returns it; returns 0 when
    /// every call succeeded.
    pub fn for_each<F>(&self, mut f: F) -> i32
    where
        F: FnMut(&str, &str) -> i32,
    {
        for (name, value) in &self.entries {
            let ret = f(name, value);
            if ret != 0 {
                return ret;
            }
        }
        0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_unset() {
        let mut vars = VariableStore::new();
        assert_eq!(vars.get("FOO"), None);

        vars.set("FOO", "bar");
        assert_eq!(vars.get("FOO"), Some("bar"));

        assert_eq!(vars.unset("FOO"), Ok(()));
        assert_eq!(vars.get("FOO"), None);
        assert_eq!(vars.unset("FOO"), Err(NotFound));
    }

    #[test]
    fn test_overwrite_moves_to_end() {
        let mut vars = VariableStore::new();
        vars.set("A", "1");
        vars.set("B", "2");
        vars.set("A", "3");

        let names: Vec<_> = vars.iter().map(|(n, v)| format!("{n}={v}")).collect();
        assert_eq!(names, ["B=2", "A=3"]);
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_for_each_stops_on_nonzero() {
        let mut vars = VariableStore::new();
        vars.set("A", "1");
        vars.set("B", "2");
        vars.set("C", "3");

        let mut seen = Vec::new();
        let ret = vars.for_each(|name, _| {
            seen.push(name.to_string());
            if name == "B" { 7 } else { 0 }
        });
        assert_eq!(ret, 7);
        assert_eq!(seen, ["A", "B"]);

        assert_eq!(vars.for_each(|_, _| 0), 0);
    }

    #[test]
    fn test_take_removes() {
        let mut vars = VariableStore::new();
        vars.set("X", "y");
        assert_eq!(vars.take("X").as_deref(), Some("y"));
        assert!(vars.is_empty());
        assert_eq!(vars.take("X"), None);
    }
}
