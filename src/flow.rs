//! Control-flow state for `if` and `while`/`until` constructs.

use crate::error::{ShellError, ShellResult};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stack capacity {capacity} exceeded")]
pub struct StackFull {
    pub capacity: usize,
}

/// A stack that refuses to grow past the capacity it was created with.
#[derive(Debug, Clone)]
pub struct FixedStack<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> FixedStack<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), StackFull> {
        if self.items.len() >= self.capacity {
            return Err(StackFull {
                capacity: self.capacity,
            });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn top(&self) -> Option<&T> {
        self.items.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut T> {
        self.items.last_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Byte offset into a script stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StreamPosition(pub u64);

impl StreamPosition {
    /// The position `bytes` further into the stream.
    pub fn advance(self, bytes: usize) -> Self {
        StreamPosition(self.0 + bytes as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfState {
    /// Waiting for the condition result and then `then`.
    If,
    Then,
    Else,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfFrame {
    pub state: IfState,
    /// The `if` itself appeared in a suppressed region.
    pub disabled: bool,
    /// The condition held (after applying `!`). `then` runs iff this is set.
    pub condition: bool,
    pub inverted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    Until,
    Do,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFrame {
    pub kind: LoopKind,
    /// The body runs on this pass, and `done` jumps back to the top.
    pub enabled: bool,
    /// Where the `while`/`until` statement starts in the script stream.
    pub top_offset: StreamPosition,
    /// Depth of the if-stack when the loop began; `done` returns to it.
    pub saved_if_depth: usize,
}

/// Where a statement result went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Consumed as the condition of an `if`, `while` or `until`.
    Condition,
    /// An ordinary statement result.
    Status { failed: bool },
}

#[derive(Debug, Clone)]
pub struct ControlFlow {
    ifs: FixedStack<IfFrame>,
    loops: FixedStack<LoopFrame>,
}

impl ControlFlow {
    pub fn new(nest_depth: usize) -> Self {
        Self {
            ifs: FixedStack::with_capacity(nest_depth),
            loops: FixedStack::with_capacity(nest_depth),
        }
    }

    pub fn if_depth(&self) -> usize {
        self.ifs.len()
    }

    pub fn loop_depth(&self) -> usize {
        self.loops.len()
    }

    pub fn innermost_if(&self) -> Option<&IfFrame> {
        self.ifs.top()
    }

    pub fn innermost_loop(&self) -> Option<&LoopFrame> {
        self.loops.top()
    }

    /// Drop every open construct.
    pub fn reset(&mut self) {
        self.truncate_to(0, 0);
    }

    /// Drop the constructs opened above the given depths, keeping the ones
    /// below them untouched.
    pub fn truncate_to(&mut self, if_depth: usize, loop_depth: usize) {
        if self.ifs.len() > if_depth || self.loops.len() > loop_depth {
            debug!(
                ifs = self.ifs.len(),
                loops = self.loops.len(),
                if_depth,
                loop_depth,
                "control flow truncated"
            );
        }
        self.ifs.truncate(if_depth);
        self.loops.truncate(loop_depth);
    }

    fn abandon<T>(&mut self, err: ShellError) -> ShellResult<T> {
        self.reset();
        Err(err)
    }

    fn if_state(&self) -> Option<IfState> {
        self.ifs.top().map(|f| f.state)
    }

    fn loop_kind(&self) -> Option<LoopKind> {
        self.loops.top().map(|f| f.kind)
    }

    fn awaiting_loop_condition(&self) -> bool {
        matches!(self.loop_kind(), Some(LoopKind::While | LoopKind::Until))
    }

    /// Whether the current statement should run.
    ///
    /// False inside a loop body whose pass is disabled (at any depth), in an
    /// `if` that was opened in a suppressed region, and in the branch of the
    /// innermost `if` that its condition rules out.
    pub fn is_enabled(&self) -> bool {
        let loops_enabled = self
            .loops
            .iter()
            .all(|f| f.kind != LoopKind::Do || f.enabled);
        let branch_enabled = match self.ifs.top() {
            None => true,
            Some(frame) if frame.disabled => false,
            Some(frame) => match frame.state {
                IfState::If => true,
                IfState::Then => frame.condition,
                IfState::Else => !frame.condition,
            },
        };
        loops_enabled && branch_enabled
    }

    /// `while`/`until`: open a loop whose top is `top`. Loops need a
    /// seekable script, so `top` is `None` for interactive input and that is
    /// a context error.
    pub fn begin_loop(&mut self, kind: LoopKind, top: Option<StreamPosition>) -> ShellResult<()> {
        let keyword = match kind {
            LoopKind::Until => "until",
            _ => "while",
        };
        let top = match top {
            Some(top) if self.if_state() != Some(IfState::If) && !self.awaiting_loop_condition() => {
                top
            }
            _ => return self.abandon(ShellError::Context(keyword.into())),
        };
        let frame = LoopFrame {
            kind,
            enabled: self.is_enabled(),
            top_offset: top,
            saved_if_depth: self.ifs.len(),
        };
        trace!(?frame, "loop begin");
        if self.loops.push(frame).is_err() {
            return self.abandon(ShellError::DeepNesting(keyword.into()));
        }
        Ok(())
    }

    pub fn enter_do(&mut self) -> ShellResult<()> {
        match self.loops.top_mut() {
            Some(frame) if matches!(frame.kind, LoopKind::While | LoopKind::Until) => {
                frame.kind = LoopKind::Do;
                Ok(())
            }
            _ => self.abandon(ShellError::Context("do".into())),
        }
    }

    /// `done`: pops the loop and returns where to resume if the loop
    /// continues.
    pub fn end_loop(&mut self) -> ShellResult<Option<StreamPosition>> {
        if self.loop_kind() != Some(LoopKind::Do) {
            return self.abandon(ShellError::Context("done".into()));
        }
        let Some(frame) = self.loops.pop() else {
            return self.abandon(ShellError::Internal("done".into()));
        };
        trace!(enabled = frame.enabled, top = frame.top_offset.0, "loop end");
        // Frames the body left open do not outlive the loop.
        self.ifs.truncate(frame.saved_if_depth);
        Ok(frame.enabled.then_some(frame.top_offset))
    }

    /// A non-keyword statement. Only `do` may follow `while`/`until`.
    pub fn check_loop_context(&mut self, name: &str) -> ShellResult<()> {
        if self.awaiting_loop_condition() {
            return self.abandon(ShellError::Context(name.into()));
        }
        Ok(())
    }

    pub fn begin_if(&mut self, inverted: bool) -> ShellResult<()> {
        if self.if_state() == Some(IfState::If) {
            return self.abandon(ShellError::Context("if".into()));
        }
        let frame = IfFrame {
            state: IfState::If,
            disabled: !self.is_enabled(),
            condition: false,
            inverted,
        };
        trace!(?frame, "if begin");
        if self.ifs.push(frame).is_err() {
            return self.abandon(ShellError::DeepNesting("if".into()));
        }
        Ok(())
    }

    pub fn enter_then(&mut self) -> ShellResult<()> {
        self.advance_if(IfState::If, IfState::Then, "then")
    }

    pub fn enter_else(&mut self) -> ShellResult<()> {
        self.advance_if(IfState::Then, IfState::Else, "else")
    }

    fn advance_if(&mut self, from: IfState, to: IfState, keyword: &str) -> ShellResult<()> {
        match self.ifs.top_mut() {
            Some(frame) if frame.state == from => {
                frame.state = to;
                Ok(())
            }
            _ => self.abandon(ShellError::Context(keyword.into())),
        }
    }

    pub fn end_if(&mut self) -> ShellResult<()> {
        if !matches!(self.if_state(), Some(IfState::Then | IfState::Else)) {
            return self.abandon(ShellError::Context("fi".into()));
        }
        match self.ifs.pop() {
            Some(frame) => {
                trace!(?frame, "if end");
                Ok(())
            }
            None => self.abandon(ShellError::Internal("if".into())),
        }
    }

    /// A non-keyword statement. Only `then` may follow the `if` statement.
    pub fn check_if_context(&mut self, name: &str) -> ShellResult<()> {
        if self.if_state() == Some(IfState::If) {
            return self.abandon(ShellError::Context(name.into()));
        }
        Ok(())
    }

    /// Route a statement result to the construct waiting for it.
    pub fn save_result(&mut self, failed: bool) -> Feedback {
        if let Some(frame) = self.loops.top_mut() {
            match frame.kind {
                LoopKind::While => {
                    frame.enabled = frame.enabled && !failed;
                    return Feedback::Condition;
                }
                LoopKind::Until => {
                    frame.enabled = frame.enabled && failed;
                    return Feedback::Condition;
                }
                LoopKind::Do => {}
            }
        }
        if let Some(frame) = self.ifs.top_mut() {
            if frame.state == IfState::If {
                frame.condition = frame.inverted ^ !failed;
                return Feedback::Condition;
            }
        }
        Feedback::Status { failed }
    }

    /// `break`: skip the rest of the innermost loop body and leave the loop
    /// at `done`. Outside a body it does nothing.
    pub fn break_loop(&mut self) {
        if let Some(frame) = self.loops.top_mut() {
            if frame.kind == LoopKind::Do {
                frame.enabled = false;
                debug!(depth = self.loops.len(), "loop break");
            }
        }
    }
}
