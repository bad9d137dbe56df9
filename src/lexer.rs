//! Splitting command lines into statements and statements into raw tokens.

use crate::error::{ShellError, ShellResult};

// Every byte with a syntactic meaning is ASCII, so byte offsets are always
// valid `str` boundaries.
const TOKEN_SEPARATORS: &[u8] = b" \t\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// `>`: create or truncate.
    Truncate,
    /// `>>`: create or append.
    Append,
}

impl RedirectMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectMode::Truncate => ">",
            RedirectMode::Append => ">>",
        }
    }
}

/// A token before expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawToken<'a> {
    /// Text of the token. For a double-quoted token the quotes are not
    /// included and `quoted` is set.
    Word { text: &'a str, quoted: bool },
    Redirect(RedirectMode),
}

impl<'a> RawToken<'a> {
    pub fn word(text: &'a str) -> Self {
        RawToken::Word {
            text,
            quoted: false,
        }
    }

    /// The token as it would appear as a plain argument.
    pub fn text(&self) -> &'a str {
        match self {
            RawToken::Word { text, .. } => text,
            RawToken::Redirect(mode) => mode.as_str(),
        }
    }

    /// True for an unquoted word equal to `keyword`.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, RawToken::Word { text, quoted: false } if *text == keyword)
    }
}

/// Read position within one statement.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Plain,
    Escaped,
    BackQuoted,
    BackQuotedEscaped,
}

/// Find the first terminator that is neither escaped nor inside a
/// back-quoted span. Back-quotes pair up with a simple toggle.
fn find_terminator(input: &[u8], is_term: impl Fn(u8) -> bool) -> Option<usize> {
    let mut state = ScanState::Plain;
    for (i, &b) in input.iter().enumerate() {
        state = match (state, b) {
            (ScanState::Escaped, _) => ScanState::Plain,
            (ScanState::BackQuotedEscaped, _) => ScanState::BackQuoted,
            (ScanState::Plain, b'\\') => ScanState::Escaped,
            (ScanState::BackQuoted, b'\\') => ScanState::BackQuotedEscaped,
            (ScanState::Plain, b'`') => ScanState::BackQuoted,
            (ScanState::BackQuoted, b'`') => ScanState::Plain,
            (ScanState::Plain, b) if is_term(b) => return Some(i),
            (state, _) => state,
        };
    }
    None
}

/// Returns the next raw token, or `None` once only separators, the end of
/// the statement or a comment remain.
///
/// `>` and `>>` are recognized at the start of a token. `#` at the start of
/// a token ends the statement; the cursor stays on it, so later calls keep
/// returning `None`.
pub fn next_token<'a>(cursor: &mut Cursor<'a>) -> ShellResult<Option<RawToken<'a>>> {
    let input = cursor.input;
    let bytes = input.as_bytes();

    while cursor.pos < bytes.len() && TOKEN_SEPARATORS.contains(&bytes[cursor.pos]) {
        cursor.pos += 1;
    }
    if cursor.pos >= bytes.len() {
        return Ok(None);
    }

    let begin = cursor.pos;
    match bytes[begin] {
        b'>' => {
            if bytes.get(begin + 1) == Some(&b'>') {
                cursor.pos = begin + 2;
                Ok(Some(RawToken::Redirect(RedirectMode::Append)))
            } else {
                cursor.pos = begin + 1;
                Ok(Some(RawToken::Redirect(RedirectMode::Truncate)))
            }
        }
        b'#' => Ok(None),
        b'"' => {
            let body = begin + 1;
            match find_terminator(&bytes[body..], |b| b == b'"') {
                Some(len) => {
                    cursor.pos = body + len + 1;
                    Ok(Some(RawToken::Word {
                        text: &input[body..body + len],
                        quoted: true,
                    }))
                }
                None => {
                    cursor.pos = bytes.len();
                    Err(ShellError::no_matching("\"", "\""))
                }
            }
        }
        _ => {
            let end = find_terminator(&bytes[begin..], |b| TOKEN_SEPARATORS.contains(&b))
                .map(|len| begin + len)
                .unwrap_or(bytes.len());
            cursor.pos = (end + 1).min(bytes.len());
            Ok(Some(RawToken::word(&input[begin..end])))
        }
    }
}

/// Collects every token of `input`. Used by tests and by callers that want
/// the whole statement at once.
pub fn tokenize(input: &str) -> ShellResult<Vec<RawToken<'_>>> {
    let mut cursor = Cursor::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = next_token(&mut cursor)? {
        tokens.push(token);
    }
    Ok(tokens)
}

/// One `;`- or newline-delimited statement and its byte offset in the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement<'a> {
    pub offset: usize,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Plain,
    Escaped,
    DoubleQuoted,
    DoubleQuotedEscaped,
    BackQuoted,
    BackQuotedEscaped,
}

/// Lazily splits a line into statements.
///
/// `;` and `\n` separate statements unless they are escaped or inside a
/// double-quoted or back-quoted span. A `#` that starts a word comments out
/// the rest of the physical line. An unterminated double quote is reported when the
/// splitter reaches it, after the statements before it have been handed out.
pub struct Statements<'a> {
    line: &'a str,
    pos: usize,
    finished: bool,
}

impl<'a> Statements<'a> {
    pub fn new(line: &'a str) -> Self {
        Self {
            line,
            pos: 0,
            finished: false,
        }
    }
}

impl<'a> Iterator for Statements<'a> {
    type Item = ShellResult<Statement<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.line.as_bytes();
        let start = self.pos;
        if self.finished || (start > 0 && start == bytes.len()) {
            return None;
        }
        let mut state = SplitState::Plain;

        for i in start..bytes.len() {
            let b = bytes[i];
            state = match (state, b) {
                (SplitState::Escaped, _) => SplitState::Plain,
                (SplitState::DoubleQuotedEscaped, _) => SplitState::DoubleQuoted,
                (SplitState::BackQuotedEscaped, _) => SplitState::BackQuoted,
                (SplitState::Plain, b'\\') => SplitState::Escaped,
                (SplitState::DoubleQuoted, b'\\') => SplitState::DoubleQuotedEscaped,
                (SplitState::BackQuoted, b'\\') => SplitState::BackQuotedEscaped,
                (SplitState::Plain, b'"') => SplitState::DoubleQuoted,
                (SplitState::DoubleQuoted, b'"') => SplitState::Plain,
                (SplitState::Plain, b'`') => SplitState::BackQuoted,
                (SplitState::BackQuoted, b'`') => SplitState::Plain,
                (SplitState::Plain, b';' | b'\n') => {
                    self.pos = i + 1;
                    return Some(Ok(Statement {
                        offset: start,
                        text: &self.line[start..i],
                    }));
                }
                (SplitState::Plain, b'#')
                    if i == start || TOKEN_SEPARATORS.contains(&bytes[i - 1]) =>
                {
                    // The comment runs to the end of the physical line.
                    match self.line[i..].find('\n') {
                        Some(len) => self.pos = i + len + 1,
                        None => self.finished = true,
                    }
                    return Some(Ok(Statement {
                        offset: start,
                        text: &self.line[start..i],
                    }));
                }
                (state, _) => state,
            };
        }

        self.finished = true;
        if matches!(
            state,
            SplitState::DoubleQuoted | SplitState::DoubleQuotedEscaped
        ) {
            return Some(Err(ShellError::no_matching("\"", "\"")));
        }
        Some(Ok(Statement {
            offset: start,
            text: &self.line[start..],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(input: &str) -> Vec<&str> {
        tokenize(input).unwrap().iter().map(|t| t.text()).collect()
    }

    #[test]
    fn test_quoted_argument_is_one_token() {
        assert_eq!(words(r#"echo "a b" c"#), ["echo", "a b", "c"]);
    }

    #[test]
    fn test_quoted_flag_and_keywords() {
        let tokens = tokenize(r#"if "if" x"#).unwrap();
        assert!(tokens[0].is_keyword("if"));
        assert!(!tokens[1].is_keyword("if"));
        assert_eq!(
            tokens[1],
            RawToken::Word {
                text: "if",
                quoted: true
            }
        );
    }

    #[test]
    fn test_redirect_tokens() {
        let tokens = tokenize("echo hi > out >>log").unwrap();
        assert_eq!(tokens[2], RawToken::Redirect(RedirectMode::Truncate));
        assert_eq!(tokens[3], RawToken::word("out"));
        assert_eq!(tokens[4], RawToken::Redirect(RedirectMode::Append));
        assert_eq!(tokens[5], RawToken::word("log"));

        // Only at the start of a token.
        assert_eq!(words("a>b"), ["a>b"]);
    }

    #[test]
    fn test_comment_ends_statement() {
        let mut cursor = Cursor::new("echo a #b c");
        assert_eq!(next_token(&mut cursor).unwrap(), Some(RawToken::word("echo")));
        assert_eq!(next_token(&mut cursor).unwrap(), Some(RawToken::word("a")));
        assert_eq!(next_token(&mut cursor).unwrap(), None);
        assert_eq!(next_token(&mut cursor).unwrap(), None);
        assert_eq!(cursor.rest(), "#b c");

        assert_eq!(words("echo a#b"), ["echo", "a#b"]);
    }

    #[test]
    fn test_backquotes_and_escapes_keep_token_together() {
        assert_eq!(words("set X `echo a b`"), ["set", "X", "`echo a b`"]);
        assert_eq!(words(r"echo a\ b"), ["echo", r"a\ b"]);
        assert_eq!(words(r#"echo "say \"hi\"""#), ["echo", r#"say \"hi\""#]);
    }

    #[test]
    fn test_missing_quote_is_an_error() {
        let err = tokenize(r#"echo "abc"#).unwrap_err();
        assert_eq!(err.to_string(), "\": no matching \"");
    }

    #[test]
    fn test_only_separators() {
        assert!(tokenize(" \t \n").unwrap().is_empty());
    }

    fn split(line: &str) -> Vec<(usize, &str)> {
        Statements::new(line)
            .map(|s| s.map(|s| (s.offset, s.text)))
            .collect::<ShellResult<_>>()
            .unwrap()
    }

    #[test]
    fn test_split_statements_with_offsets() {
        assert_eq!(
            split("echo a; echo b;echo c\n"),
            [(0, "echo a"), (7, " echo b"), (15, "echo c")]
        );
    }

    #[test]
    fn test_split_respects_quotes_and_comments() {
        assert_eq!(split(r#"echo "a;b"; x"#), [(0, r#"echo "a;b""#), (11, " x")]);
        assert_eq!(split("set V `a;b`"), [(0, "set V `a;b`")]);
        assert_eq!(split(r"echo a\;b"), [(0, r"echo a\;b")]);
        assert_eq!(split("echo a # x; y"), [(0, "echo a ")]);
        assert_eq!(split("#only"), [(0, "")]);
        assert_eq!(split("a # x\nb"), [(0, "a "), (6, "b")]);
    }

    #[test]
    fn test_split_reports_unmatched_quote_late() {
        let mut it = Statements::new(r#"echo a; echo "b"#);
        assert_eq!(it.next().unwrap().unwrap().text, "echo a");
        assert!(matches!(
            it.next(),
            Some(Err(ShellError::NoMatching { .. }))
        ));
        assert!(it.next().is_none());
    }
}
