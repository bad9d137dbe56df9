use crate::error::ShellError;
use crate::interpreter::Interpreter;
use tracing::trace;

/// Index of the first unescaped `target` in `bytes`.
fn find_unescaped(bytes: &[u8], target: u8) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == target {
            return Some(i);
        }
    }
    None
}

fn identifier_len(s: &str) -> usize {
    s.bytes()
        .enumerate()
        .take_while(|&(i, b)| b == b'_' || b.is_ascii_alphabetic() || (i > 0 && b.is_ascii_digit()))
        .count()
}

/// Remove one level of backslash escaping: `\x` becomes `x`.
pub fn dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Value of a variable reference: shell variables first, then the
/// environment, then the empty string. `?` is the status of the previous
/// statement.
pub fn variable_value(sh: &Interpreter, name: &str) -> String {
    if name == "?" {
        return if sh.last_failed() { "1" } else { "0" }.to_string();
    }
    sh.vars()
        .get(name)
        .or_else(|| sh.env().get_var(name))
        .unwrap_or_default()
        .to_string()
}

/// Expand one raw token into its final argument string.
pub fn expand(sh: &mut Interpreter, raw: &str) -> String {
    let features = sh.config().features.clone();
    let bytes = raw.as_bytes();
    let mut out = String::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
            }
            b'`' if features.command_substitution => {
                out.push_str(&raw[literal_start..i]);
                let body = i + 1;
                let Some(len) = find_unescaped(&bytes[body..], b'`') else {
                    sh.report(&ShellError::no_matching("`", "`"));
                    return String::new();
                };
                trace!(command = &raw[body..body + len], "substitution");
                match sh.capture(&raw[body..body + len]) {
                    Ok(output) => {
                        out.push_str(output.trim_end_matches(|c: char| c.is_control()))
                    }
                    Err(err) => sh.report(&err),
                }
                i = body + len + 1;
                literal_start = i;
            }
            b'$' if features.variables => {
                out.push_str(&raw[literal_start..i]);
                let rest = &raw[i + 1..];
                let (name, consumed) = if let Some(inner) = rest.strip_prefix('{') {
                    let Some(len) = find_unescaped(inner.as_bytes(), b'}') else {
                        sh.report(&ShellError::no_matching("${", "}"));
                        return String::new();
                    };
                    (&inner[..len], len + 2)
                } else if rest.starts_with('?') {
                    ("?", 1)
                } else {
                    let len = identifier_len(rest);
                    (&rest[..len], len)
                };

                if consumed == 0 {
                    // A lone `$` stays literal.
                    literal_start = i;
                    i += 1;
                    continue;
                }

                let value = variable_value(sh, name);
                if sh.options().trace {
                    let _ = writeln!(sh.stderr(), "  {name}={value}");
                }
                out.push_str(&value);
                i += 1 + consumed;
                literal_start = i;
            }
            _ => i += 1,
        }
    }

    if literal_start < bytes.len() {
        out.push_str(&raw[literal_start..]);
    }
    dequote(&out)
}
