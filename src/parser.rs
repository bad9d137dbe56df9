use crate::command::ExitCode;
use crate::dispatch::{self, NICE_MAX, NICE_MIN, Redirect};
use crate::error::{ShellError, ShellResult};
use crate::expand::expand;
use crate::flow::{ControlFlow, Feedback, LoopKind, StreamPosition};
use crate::interpreter::Interpreter;
use crate::io_adapters::MemWriter;
use crate::lexer::{Cursor, RawToken, Statements, next_token};
use crate::script::{ScriptLine, ScriptStream};
use std::io;
use std::mem;
use tracing::trace;

/// Default priority change of `nice` without `-d`.
pub const DEFAULT_NICE_DELTA: i32 = 10;

/// Per-session parser state.
#[derive(Debug)]
pub struct ParserState {
    /// Result of the last statement that was not a condition.
    pub last_failed: bool,
    pub background_requested: bool,
    pub nice_delta: i32,
    /// Output of the running statement does not go to the session sink.
    pub redirect_active: bool,
    pub flow: ControlFlow,
    /// The script being run, if any. Loops need it to jump back.
    pub script_stream: Option<ScriptStream>,
    /// The line of `script_stream` being run.
    pub script_line: Option<ScriptLine>,
    /// Where the current statement starts within its line.
    pub statement_offset: usize,
    /// Set by `done` after it moved the script stream; the rest of the line
    /// is abandoned.
    pub jump: bool,
}

impl ParserState {
    pub fn new(nest_depth: usize) -> Self {
        Self {
            last_failed: false,
            background_requested: false,
            nice_delta: 0,
            redirect_active: false,
            flow: ControlFlow::new(nest_depth),
            script_stream: None,
            script_line: None,
            statement_offset: 0,
            jump: false,
        }
    }

    fn loop_top(&self) -> Option<StreamPosition> {
        self.script_stream.as_ref()?;
        self.script_line
            .as_ref()
            .map(|line| line.position_of(self.statement_offset))
    }
}

enum Outcome {
    /// Only control-flow keywords, or the statement is suppressed.
    Skipped,
    Ran(ExitCode),
}

/// Run every statement of `line`. Returns 1 if any statement failed.
///
/// A failing statement does not stop the ones after it. A loop jump or
/// `exit` does.
pub fn parse_line(sh: &mut Interpreter, line: &str) -> ExitCode {
    sh.state_mut().jump = false;
    for job in sh.jobs_mut().reap() {
        trace!(id = job.id, name = job.name.as_str(), status = job.status, "job reaped");
    }

    let mut failed = false;
    for statement in Statements::new(line) {
        let statement = match statement {
            Ok(statement) => statement,
            Err(err) => {
                sh.report(&err);
                sh.state_mut().last_failed = true;
                failed = true;
                break;
            }
        };
        sh.state_mut().statement_offset = statement.offset;
        failed |= parse_command(sh, statement.text);
        if sh.state().jump || sh.env().should_exit {
            break;
        }
    }
    ExitCode::from(failed)
}

/// Run a single statement and feed its result to the control-flow state.
/// Returns whether it counts as a failure.
pub fn parse_command(sh: &mut Interpreter, text: &str) -> bool {
    {
        let state = sh.state_mut();
        state.background_requested = false;
        state.redirect_active = false;
        state.nice_delta = 0;
    }
    match run_statement(sh, text) {
        Ok(Outcome::Skipped) => false,
        Ok(Outcome::Ran(status)) => record_result(sh, status != 0),
        Err(err) => {
            sh.report(&err);
            record_result(sh, true)
        }
    }
}

fn record_result(sh: &mut Interpreter, failed: bool) -> bool {
    let state = sh.state_mut();
    match state.flow.save_result(failed) {
        Feedback::Condition => {
            state.last_failed = false;
            false
        }
        Feedback::Status { failed } => {
            state.last_failed = failed;
            failed
        }
    }
}

fn run_statement(sh: &mut Interpreter, text: &str) -> ShellResult<Outcome> {
    let features = sh.config().features.clone();
    let mut cursor = Cursor::new(text);

    let mut token = next_token(&mut cursor)?;
    if features.loops {
        if let Some(t) = token {
            token = loop_keyword(sh, t, &mut cursor)?;
        }
    }
    if features.if_then_else {
        if let Some(t) = token {
            token = if_keyword(sh, t, &mut cursor)?;
        }
    }
    if features.background {
        if let Some(t) = token {
            token = nice_prefix(sh, t, &mut cursor)?;
        }
    }

    let Some(command) = token else {
        return Ok(Outcome::Skipped);
    };
    if !sh.state().flow.is_enabled() {
        return Ok(Outcome::Skipped);
    }

    let max_entries = sh.config().max_argv_entries();
    let mut words = vec![command];
    while let Some(t) = next_token(&mut cursor)? {
        if words.len() >= max_entries {
            return Err(ShellError::TooManyArgs(command.text().into()));
        }
        words.push(t);
    }

    let background = features.background
        && words.len() > 1
        && words.last().is_some_and(|t| t.is_keyword("&"));
    if background {
        words.pop();
    }

    let mut redirect_target = None;
    if features.redirection && words.len() > 2 {
        if let RawToken::Redirect(mode) = words[words.len() - 2] {
            let target = words[words.len() - 1];
            if let RawToken::Redirect(extra) = target {
                return Err(ShellError::Syntax(extra.as_str().into()));
            }
            words.truncate(words.len() - 2);
            redirect_target = Some((mode, target.text()));
        }
    }
    if features.redirection {
        if let Some(RawToken::Redirect(mode)) =
            words.iter().find(|t| matches!(t, RawToken::Redirect(_)))
        {
            return Err(ShellError::Syntax(mode.as_str().into()));
        }
    }

    if words.len() - 1 > sh.config().max_arguments {
        return Err(ShellError::TooManyArgs(command.text().into()));
    }

    let mut argv = Vec::with_capacity(words.len());
    for word in &words {
        argv.push(expand(sh, word.text()));
    }
    let redirect = match redirect_target {
        Some((mode, raw)) => {
            let target = expand(sh, raw);
            Some(Redirect {
                path: sh.env().full_path(target),
                mode,
            })
        }
        None => None,
    };

    let nice_delta = {
        let state = sh.state_mut();
        state.background_requested = background;
        state.redirect_active = redirect.is_some();
        state.nice_delta
    };
    let status = dispatch::execute(sh, argv, redirect, background, nice_delta)?;
    Ok(Outcome::Ran(status))
}

/// The next token, which must exist and be non-empty. Otherwise the
/// construct being opened is abandoned.
fn required<'a>(
    sh: &mut Interpreter,
    cursor: &mut Cursor<'a>,
    keyword: &str,
) -> ShellResult<RawToken<'a>> {
    match next_token(cursor)? {
        Some(t) if !t.text().is_empty() => Ok(t),
        _ => {
            sh.state_mut().flow.reset();
            Err(ShellError::ArgInvalid(keyword.into()))
        }
    }
}

/// `done` and `fi` stand alone.
fn no_trailing(sh: &mut Interpreter, cursor: &mut Cursor<'_>, keyword: &str) -> ShellResult<()> {
    if next_token(cursor)?.is_some() {
        sh.state_mut().flow.reset();
        return Err(ShellError::ArgInvalid(keyword.into()));
    }
    Ok(())
}

fn loop_keyword<'a>(
    sh: &mut Interpreter,
    token: RawToken<'a>,
    cursor: &mut Cursor<'a>,
) -> ShellResult<Option<RawToken<'a>>> {
    let kind = if token.is_keyword("while") {
        Some(LoopKind::While)
    } else if token.is_keyword("until") {
        Some(LoopKind::Until)
    } else {
        None
    };

    if let Some(kind) = kind {
        let condition = required(sh, cursor, token.text())?;
        let top = sh.state().loop_top();
        sh.state_mut().flow.begin_loop(kind, top)?;
        return Ok(Some(condition));
    }
    if token.is_keyword("do") {
        let next = next_token(cursor)?;
        sh.state_mut().flow.enter_do()?;
        return Ok(next);
    }
    if token.is_keyword("done") {
        no_trailing(sh, cursor, "done")?;
        if let Some(top) = sh.state_mut().flow.end_loop()? {
            rewind(sh, top)?;
        }
        return Ok(None);
    }

    sh.state_mut().flow.check_loop_context(token.text())?;
    Ok(Some(token))
}

fn rewind(sh: &mut Interpreter, top: StreamPosition) -> ShellResult<()> {
    let state = sh.state_mut();
    let Some(stream) = state.script_stream.as_mut() else {
        state.flow.reset();
        return Err(ShellError::Internal("done".into()));
    };
    stream
        .seek(top)
        .map_err(|e| ShellError::failed("done", "seek", e))?;
    state.jump = true;
    trace!(offset = top.0, "loop rewind");
    Ok(())
}

fn if_keyword<'a>(
    sh: &mut Interpreter,
    token: RawToken<'a>,
    cursor: &mut Cursor<'a>,
) -> ShellResult<Option<RawToken<'a>>> {
    if token.is_keyword("if") {
        let mut condition = required(sh, cursor, "if")?;
        let inverted = condition.is_keyword("!");
        if inverted {
            condition = required(sh, cursor, "if")?;
        }
        sh.state_mut().flow.begin_if(inverted)?;
        return Ok(Some(condition));
    }
    if token.is_keyword("then") {
        let next = next_token(cursor)?;
        sh.state_mut().flow.enter_then()?;
        return Ok(next);
    }
    if token.is_keyword("else") {
        let next = next_token(cursor)?;
        sh.state_mut().flow.enter_else()?;
        return Ok(next);
    }
    if token.is_keyword("fi") {
        no_trailing(sh, cursor, "fi")?;
        sh.state_mut().flow.end_if()?;
        return Ok(None);
    }

    sh.state_mut().flow.check_if_context(token.text())?;
    Ok(Some(token))
}

/// `nice [-d N] command ...`
fn nice_prefix<'a>(
    sh: &mut Interpreter,
    token: RawToken<'a>,
    cursor: &mut Cursor<'a>,
) -> ShellResult<Option<RawToken<'a>>> {
    if !token.is_keyword("nice") {
        return Ok(Some(token));
    }
    sh.state_mut().nice_delta = DEFAULT_NICE_DELTA;

    let mut command = next_token(cursor)?;
    if let Some(option) = command {
        if option.is_keyword("-d") {
            if let Some(value) = next_token(cursor)? {
                let value = expand(sh, value.text());
                let delta = value
                    .parse::<i32>()
                    .ok()
                    .filter(|d| (NICE_MIN..=NICE_MAX).contains(d))
                    .ok_or_else(|| ShellError::ArgInvalid("nice".into()))?;
                sh.state_mut().nice_delta = delta;
                command = next_token(cursor)?;
            }
        }
    }
    Ok(command)
}

/// Run `cmdline` with its output captured and return what it printed.
///
/// Keywords have no meaning here and the statement never feeds the
/// control-flow state. A failing command is an error.
pub fn parse_substitution(sh: &mut Interpreter, cmdline: &str) -> ShellResult<String> {
    if !sh.state().flow.is_enabled() {
        return Ok(String::new());
    }

    let (saved_background, saved_redirect) = {
        let state = sh.state_mut();
        (
            mem::replace(&mut state.background_requested, false),
            mem::replace(&mut state.redirect_active, true),
        )
    };
    let (capture, output) = MemWriter::with_handle();
    let previous = sh.replace_stdout(Box::new(capture));

    let result = run_captured(sh, cmdline);

    sh.replace_stdout(previous);
    {
        let state = sh.state_mut();
        state.background_requested = saved_background;
        state.redirect_active = saved_redirect;
    }

    let status = match result {
        Ok(status) => status,
        Err(err) => {
            sh.report(&err);
            1
        }
    };
    if status != 0 {
        return Err(ShellError::failed(
            "``",
            "exec",
            io::Error::other(format!("exit status {status}")),
        ));
    }
    Ok(output.contents_lossy())
}

fn run_captured(sh: &mut Interpreter, cmdline: &str) -> ShellResult<ExitCode> {
    let max_entries = sh.config().max_argv_entries();
    let mut cursor = Cursor::new(cmdline);
    let mut words = Vec::new();
    while let Some(t) = next_token(&mut cursor)? {
        if words.len() >= max_entries {
            return Err(ShellError::TooManyArgs("``".into()));
        }
        words.push(t.text());
    }
    if words.is_empty() {
        return Ok(0);
    }
    if words.len() - 1 > sh.config().max_arguments {
        return Err(ShellError::TooManyArgs(words[0].into()));
    }

    let mut argv = Vec::with_capacity(words.len());
    for word in words {
        argv.push(expand(sh, word));
    }
    dispatch::execute(sh, argv, None, false, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::test_session;

    fn run(sh: &mut Interpreter, script: &str) -> ExitCode {
        sh.run_stream(ScriptStream::from_text(script))
    }

    #[test]
    fn test_statements_run_in_order() {
        let (mut sh, out, err) = test_session();
        assert_eq!(parse_line(&mut sh, "echo a; echo b\necho c"), 0);
        assert_eq!(out.contents_lossy(), "a\nb\nc\n");
        assert!(err.contents().is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_line() {
        let (mut sh, out, err) = test_session();
        assert_eq!(parse_line(&mut sh, "no-such-cmd-xyz; echo after"), 1);
        assert_eq!(out.contents_lossy(), "after\n");
        assert_eq!(
            err.contents_lossy(),
            "emsh: no-such-cmd-xyz: command not found\n"
        );
        assert!(!sh.last_failed());
    }

    #[test]
    fn test_unmatched_quote_abandons_line() {
        let (mut sh, out, err) = test_session();
        assert_eq!(parse_line(&mut sh, "echo one; echo \"two"), 1);
        assert_eq!(out.contents_lossy(), "one\n");
        assert_eq!(err.contents_lossy(), "emsh: \": no matching \"\n");
        assert!(sh.last_failed());
    }

    #[test]
    fn test_comment_only_line() {
        let (mut sh, out, _) = test_session();
        assert_eq!(parse_line(&mut sh, "# nothing here"), 0);
        assert_eq!(parse_line(&mut sh, "echo a # trailing"), 0);
        assert_eq!(out.contents_lossy(), "a\n");
    }

    #[test]
    fn test_if_then_else_single_line() {
        let (mut sh, out, _) = test_session();
        parse_line(&mut sh, "if true; then echo T; else echo E; fi");
        parse_line(&mut sh, "if false; then echo T; else echo E; fi");
        parse_line(&mut sh, "if ! false; then echo N; fi");
        assert_eq!(out.contents_lossy(), "T\nE\nN\n");
        assert_eq!(sh.state().flow.if_depth(), 0);
    }

    #[test]
    fn test_condition_does_not_set_status() {
        let (mut sh, out, _) = test_session();
        parse_line(&mut sh, "if false; then echo T; fi; echo $?");
        assert_eq!(out.contents_lossy(), "0\n");
    }

    #[test]
    fn test_nested_if_in_skipped_branch() {
        let (mut sh, out, _) = test_session();
        let script = "\
if false
then
  if true
  then
    echo inner
  else
    echo inner-else
  fi
else
  echo outer-else
fi
";
        assert_eq!(run(&mut sh, script), 0);
        assert_eq!(out.contents_lossy(), "outer-else\n");
    }

    #[test]
    fn test_keyword_out_of_context() {
        let (mut sh, _, err) = test_session();
        assert_eq!(parse_line(&mut sh, "then echo x"), 1);
        assert_eq!(err.contents_lossy(), "emsh: then: not valid in this context\n");

        err.clear();
        parse_line(&mut sh, "if true; echo x");
        assert_eq!(err.contents_lossy(), "emsh: echo: not valid in this context\n");
        assert_eq!(sh.state().flow.if_depth(), 0);
    }

    #[test]
    fn test_keyword_requires_condition() {
        let (mut sh, _, err) = test_session();
        assert_eq!(parse_line(&mut sh, "if"), 1);
        assert_eq!(err.contents_lossy(), "emsh: if: argument invalid\n");
    }

    #[test]
    fn test_closing_keyword_rejects_arguments() {
        let (mut sh, _, err) = test_session();
        parse_line(&mut sh, "if true; then echo; fi now");
        assert_eq!(err.contents_lossy(), "emsh: fi: argument invalid\n");
        assert_eq!(sh.state().flow.if_depth(), 0);
    }

    #[test]
    fn test_quoted_keyword_is_a_word() {
        let (mut sh, out, err) = test_session();
        parse_line(&mut sh, "echo \"if\" then");
        assert_eq!(out.contents_lossy(), "if then\n");
        assert!(err.contents().is_empty());
    }

    #[test]
    fn test_nesting_limit() {
        let (mut sh, out, err) = test_session();
        for _ in 0..3 {
            parse_line(&mut sh, "if true");
            parse_line(&mut sh, "then");
        }
        assert_eq!(sh.state().flow.if_depth(), 3);
        parse_line(&mut sh, "if true");
        assert_eq!(err.contents_lossy(), "emsh: if: nesting too deep\n");
        assert_eq!(sh.state().flow.if_depth(), 0);

        parse_line(&mut sh, "if true; then echo ok; fi");
        assert_eq!(out.contents_lossy(), "ok\n");
    }

    #[test]
    fn test_while_loop() {
        let (mut sh, out, err) = test_session();
        let script = "\
set S \"\"
while test \"$S\" != xxx
do
  echo \"iter $S\"
  set S x$S
done
echo end
";
        assert_eq!(run(&mut sh, script), 0);
        assert_eq!(out.contents_lossy(), "iter \niter x\niter xx\nend\n");
        assert!(err.contents().is_empty());
    }

    #[test]
    fn test_loop_on_one_line() {
        let (mut sh, out, _) = test_session();
        let script = "set S \"\"\nwhile test \"$S\" != xx; do set S x$S; echo $S; done\necho end\n";
        assert_eq!(run(&mut sh, script), 0);
        assert_eq!(out.contents_lossy(), "x\nxx\nend\n");
    }

    #[test]
    fn test_loop_after_invalid_utf8_on_same_line() {
        let (mut sh, out, err) = test_session();
        let script = b"set S \"\"\necho \xff; while test \"$S\" != xx; do set S x$S; echo $S; done\necho end\n";
        let status = sh.run_stream(ScriptStream::new(std::io::Cursor::new(script.to_vec())));
        assert_eq!(status, 0);
        assert_eq!(out.contents_lossy(), "\u{fffd}\nx\nxx\nend\n");
        assert!(err.contents().is_empty());
    }

    #[test]
    fn test_until_loop_and_zero_passes() {
        let (mut sh, out, _) = test_session();
        let script = "\
set S \"\"
until test \"$S\" = xx
do
  set S x$S
done
while false
do
  echo never
done
echo $S
";
        assert_eq!(run(&mut sh, script), 0);
        assert_eq!(out.contents_lossy(), "xx\n");
    }

    #[test]
    fn test_break_leaves_loop() {
        let (mut sh, out, err) = test_session();
        let script = "\
set S \"\"
while true
do
  set S x$S
  if test $S = xx
  then
    break
  fi
  echo $S
done
echo end $S
";
        assert_eq!(run(&mut sh, script), 0);
        assert_eq!(out.contents_lossy(), "x\nend xx\n");
        assert!(err.contents().is_empty());
    }

    #[test]
    fn test_loop_needs_script() {
        let (mut sh, _, err) = test_session();
        parse_line(&mut sh, "while true; do echo x; done");
        assert!(err
            .contents_lossy()
            .starts_with("emsh: while: not valid in this context\n"));
        assert_eq!(sh.state().flow.loop_depth(), 0);
    }

    #[test]
    fn test_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let (mut sh, out, _) = test_session();
        sh.vars_mut().set("OUT", path.to_string_lossy());

        parse_line(&mut sh, "echo one > $OUT");
        parse_line(&mut sh, "echo two >> $OUT");
        parse_line(&mut sh, "echo screen");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert_eq!(out.contents_lossy(), "screen\n");
    }

    #[test]
    fn test_misplaced_redirect_is_syntax_error() {
        let (mut sh, out, err) = test_session();
        assert_eq!(parse_line(&mut sh, "echo > a b"), 1);
        assert_eq!(err.contents_lossy(), "emsh: >: syntax error\n");
        err.clear();
        assert_eq!(parse_line(&mut sh, "echo a >"), 1);
        assert_eq!(err.contents_lossy(), "emsh: >: syntax error\n");
        assert!(out.contents().is_empty());
    }

    #[test]
    fn test_too_many_arguments() {
        let (mut sh, out, err) = test_session();
        let line = format!("echo {}", vec!["a"; 12].join(" "));
        assert_eq!(parse_line(&mut sh, &line), 1);
        assert_eq!(err.contents_lossy(), "emsh: echo: too many arguments\n");
        assert!(out.contents().is_empty());

        let line = format!("echo {}", vec!["a"; 11].join(" "));
        assert_eq!(parse_line(&mut sh, &line), 0);
    }

    #[test]
    fn test_nice_validation() {
        let (mut sh, _, err) = test_session();
        assert_eq!(parse_line(&mut sh, "nice -d 50 echo x &"), 1);
        assert_eq!(err.contents_lossy(), "emsh: nice: argument invalid\n");
        err.clear();
        assert_eq!(parse_line(&mut sh, "nice -d abc echo x &"), 1);
        assert_eq!(err.contents_lossy(), "emsh: nice: argument invalid\n");
    }

    #[test]
    fn test_background_launch_report() {
        let (mut sh, out, _) = test_session();
        assert_eq!(parse_line(&mut sh, "nice -d 5 true &"), 0);
        let done = sh.wait_background();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, 0);
        assert!(out.contents_lossy().starts_with("true [1:"));
    }

    #[test]
    fn test_lone_ampersand_is_a_command() {
        let (mut sh, _, err) = test_session();
        assert_eq!(parse_line(&mut sh, "&"), 1);
        assert_eq!(err.contents_lossy(), "emsh: &: command not found\n");
    }

    #[test]
    fn test_substitution() {
        let (mut sh, out, _) = test_session();
        parse_line(&mut sh, "echo `echo hi`");
        parse_line(&mut sh, "set V `echo a b`; echo <$V>");
        assert_eq!(out.contents_lossy(), "hi\n<a b>\n");
    }

    #[test]
    fn test_substitution_failure() {
        let (mut sh, out, err) = test_session();
        assert_eq!(parse_substitution(&mut sh, "echo inner").unwrap(), "inner\n");
        let failure = parse_substitution(&mut sh, "false").unwrap_err();
        assert_eq!(failure.to_string(), "``: exec failed: exit status 1");

        parse_line(&mut sh, "echo [`no-such-cmd-xyz`]");
        assert_eq!(out.contents_lossy(), "[]\n");
        assert_eq!(
            err.contents_lossy(),
            "emsh: no-such-cmd-xyz: command not found\n\
             emsh: ``: exec failed: exit status 1\n"
        );
    }

    #[test]
    fn test_substitution_keeps_statement_flags() {
        let (mut sh, _, _) = test_session();
        sh.state_mut().background_requested = true;
        parse_substitution(&mut sh, "true").unwrap();
        assert!(sh.state().background_requested);
        assert!(!sh.state().redirect_active);
    }
}
