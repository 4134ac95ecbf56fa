//! Callstack-based grammar iterator: walks a `Thread`'s tokens one at a
//! time, either flat (no unrolling) or descending into Sequences/Loops,
//! reconstructing each token's `referential_timestamp` as it goes.

use crate::thread::Thread;
use crate::token::{Token, TokenKind};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Controls whether `move_to_*`/`poll_*` descend into Sequence and Loop
/// tokens or treat them as opaque leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrollFlags(u8);

impl UnrollFlags {
    /// Treat Sequences and Loops as opaque leaves.
    pub const NO_UNROLL: Self = Self(0);
    /// Descend into Sequence tokens.
    pub const UNROLL_SEQUENCE: Self = Self(1);
    /// Descend into Loop tokens.
    pub const UNROLL_LOOP: Self = Self(2);
    /// Descend into both Sequence and Loop tokens.
    pub const UNROLL_ALL: Self = Self(3);

    fn sequence(self) -> bool {
        self.0 & 1 != 0
    }

    fn r#loop(self) -> bool {
        self.0 & 2 != 0
    }

    fn allows(self, kind: TokenKind) -> bool {
        match kind {
            TokenKind::Sequence => self.sequence(),
            TokenKind::Loop => self.r#loop(),
            _ => false,
        }
    }
}

/// One level of the reader's callstack: the iterable being walked and the
/// position within it. Frames form a persistent (structurally shared)
/// linked list via `Rc`, so taking a checkpoint is a cheap `Rc` clone
/// rather than a deep copy of the whole stack.
struct FrameNode {
    parent: Option<Rc<FrameNode>>,
    iterable: Token,
    index: usize,
}

/// One materialised occurrence, as returned by the observation helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// One occurrence of an Event, with its duration.
    Event {
        /// The Event's dense id within its owning Thread.
        id: u32,
        /// This occurrence's duration.
        duration: u64,
    },
    /// One occurrence of a Sequence, with its duration.
    Sequence {
        /// The Sequence's dense id within its owning Thread.
        id: u32,
        /// This occurrence's duration.
        duration: u64,
    },
    /// One occurrence of a Loop, with the iteration count of that
    /// occurrence.
    Loop {
        /// The Loop's dense id within its owning Thread.
        id: u32,
        /// Number of times the body ran in this occurrence.
        nb_iterations: u32,
    },
}

/// Sequential (and checkpoint-restorable) iterator over one Thread's
/// grammar.
pub struct ThreadReader {
    thread: Arc<Thread>,
    top: Option<Rc<FrameNode>>,
    token_count: FxHashMap<Token, usize>,
    /// The reconstructed absolute timestamp (ns since the thread's first
    /// event) at the current position.
    pub referential_timestamp: u64,
}

impl ThreadReader {
    /// Starts a reader at the beginning of `thread`'s root sequence.
    pub fn new(thread: Arc<Thread>) -> Self {
        let root = Token::new(TokenKind::Sequence, 0);
        Self {
            thread,
            top: Some(Rc::new(FrameNode { parent: None, iterable: root, index: 0 })),
            token_count: FxHashMap::default(),
            referential_timestamp: 0,
        }
    }

    /// The token at the current frame's position, or `None` at end of
    /// trace.
    pub fn poll_cur_token(&self) -> Option<Token> {
        Self::cur_token_of(&self.thread, &self.top)
    }

    fn cur_token_of(thread: &Thread, frame: &Option<Rc<FrameNode>>) -> Option<Token> {
        let frame = frame.as_ref()?;
        let len = thread.child_count(frame.iterable);
        if frame.index >= len {
            return None;
        }
        Some(thread.get_token(frame.iterable, frame.index))
    }

    /// Duration of `tok`'s `occ`-th occurrence (0-indexed).
    fn token_duration_at(&self, tok: Token, occ: usize) -> u64 {
        match tok.kind() {
            TokenKind::Event => self.thread.events[tok.id() as usize].durations.at(occ),
            TokenKind::Sequence => self.thread.sequences[tok.id() as usize].durations.at(occ),
            TokenKind::Loop => {
                let lp = &self.thread.loops[tok.id() as usize];
                let iterations = lp.nb_iterations[occ] as usize;
                let prior: usize = lp.nb_iterations[..occ].iter().map(|&n| n as usize).sum();
                let body = &self.thread.sequences[lp.repeated_token.id() as usize];
                (prior..prior + iterations).map(|i| body.durations.at(i)).sum()
            }
            TokenKind::Invalid => 0,
        }
    }

    fn token_duration(&self, tok: Token) -> u64 {
        let occ = *self.token_count.get(&tok).unwrap_or(&0);
        self.token_duration_at(tok, occ)
    }

    /// Folds (`add`) or unfolds (`!add`) the occurrence counts of every
    /// token nested inside `tok`'s `occ`-th occurrence into `token_count`,
    /// when `tok` is a Sequence or Loop crossed whole rather than unrolled
    /// into. Mirrors the original's `tokenCount += sequence->getTokenCount`
    /// bulk merge, so a token nested inside a block that's skipped over (not
    /// entered) still gets the right occurrence recorded for later lookups.
    fn fold_nested_counts(&mut self, tok: Token, occ: usize, add: bool) {
        match tok.kind() {
            TokenKind::Sequence => {
                let counts = self.thread.sequences[tok.id() as usize].token_count(&self.thread).clone();
                self.merge_counts(&counts, add);
            }
            TokenKind::Loop => {
                let lp = &self.thread.loops[tok.id() as usize];
                let iterations = lp.nb_iterations[occ] as usize;
                let body = lp.repeated_token;
                let body_counts = self.thread.sequences[body.id() as usize].token_count(&self.thread).clone();
                for _ in 0..iterations {
                    self.merge_counts(&body_counts, add);
                    let entry = self.token_count.entry(body).or_insert(0);
                    if add {
                        *entry += 1;
                    } else {
                        *entry -= 1;
                    }
                }
            }
            TokenKind::Event | TokenKind::Invalid => {}
        }
    }

    fn merge_counts(&mut self, counts: &FxHashMap<Token, usize>, add: bool) {
        for (&k, &v) in counts {
            let entry = self.token_count.entry(k).or_insert(0);
            if add {
                *entry += v;
            } else {
                *entry -= v;
            }
        }
    }

    /// Non-mutating peek at the token `move_to_next_token(flags)` would
    /// return.
    pub fn poll_next_token(&self, flags: UnrollFlags) -> Option<Token> {
        let mut probe = self.checkpoint();
        probe.move_to_next_token(flags)
    }

    /// Non-mutating peek at the token `move_to_prev_token(flags)` would
    /// return.
    pub fn poll_prev_token(&self, flags: UnrollFlags) -> Option<Token> {
        let mut probe = self.checkpoint();
        probe.move_to_prev_token(flags)
    }

    /// Advances one step, either descending into an enterable iterable or
    /// crossing the current token and moving past it (advancing the index,
    /// or popping one or more exhausted frames). Updates
    /// `referential_timestamp` and the internal occurrence-count map for
    /// whatever token was crossed. Returns the new current token, or
    /// `None` at end of trace.
    pub fn move_to_next_token(&mut self, flags: UnrollFlags) -> Option<Token> {
        let cur_tok = self.poll_cur_token()?;
        let frame = self.top.clone().unwrap();

        if flags.allows(cur_tok.kind()) && self.thread.child_count(cur_tok) > 0 {
            self.top = Some(Rc::new(FrameNode { parent: Some(frame), iterable: cur_tok, index: 0 }));
            return self.poll_cur_token();
        }

        let duration = self.token_duration(cur_tok);
        self.referential_timestamp += duration;
        let occ = *self.token_count.get(&cur_tok).unwrap_or(&0);
        self.fold_nested_counts(cur_tok, occ, true);
        *self.token_count.entry(cur_tok).or_insert(0) += 1;

        self.advance_or_leave(frame)
    }

    fn advance_or_leave(&mut self, frame: Rc<FrameNode>) -> Option<Token> {
        let len = self.thread.child_count(frame.iterable);
        if frame.index + 1 < len {
            self.top =
                Some(Rc::new(FrameNode { parent: frame.parent.clone(), iterable: frame.iterable, index: frame.index + 1 }));
            return self.poll_cur_token();
        }
        match frame.parent.clone() {
            None => {
                self.top = None;
                None
            }
            Some(parent) => self.advance_or_leave(parent),
        }
    }

    /// Symmetric backward step: the exact inverse of `move_to_next_token`,
    /// computed independently rather than replayed from a history stack, so
    /// it works correctly after `checkpoint()`/`restore()` or
    /// `enter_block()`/`leave_block()`. A frame sitting at `index == 0` has
    /// had nothing crossed inside it yet, so it is exactly the frame a prior
    /// descend created; undoing that descend is a single, complete step —
    /// pop to the parent and return immediately, mirroring how
    /// `move_to_next_token`'s own descend returns without touching any
    /// duration. Otherwise this steps one position back in the current
    /// frame. If the token just before that position is itself an iterable
    /// that `flags` allow entering, the frame is reconstructed at
    /// `index = children_count` (spec.md §4.7) and the walk continues one
    /// level deeper, so the reader lands on that block's last descendant —
    /// this mirrors `advance_or_leave`'s chaining of a leaf-cross with the
    /// pops/advances it triggers, all within one call. Otherwise the token
    /// just before is a leaf: subtract its duration and decrement its
    /// occurrence count, undoing exactly what crossing it forward did.
    /// Returns `None` at the start of the trace.
    pub fn move_to_prev_token(&mut self, flags: UnrollFlags) -> Option<Token> {
        loop {
            let frame = self.top.clone()?;
            if frame.index == 0 {
                self.top = frame.parent.clone();
                return self.poll_cur_token();
            }

            let prev_index = frame.index - 1;
            let prev_tok = self.thread.get_token(frame.iterable, prev_index);

            if flags.allows(prev_tok.kind()) && self.thread.child_count(prev_tok) > 0 {
                let children = self.thread.child_count(prev_tok);
                let rewound_parent =
                    Rc::new(FrameNode { parent: frame.parent.clone(), iterable: frame.iterable, index: prev_index });
                self.top = Some(Rc::new(FrameNode { parent: Some(rewound_parent), iterable: prev_tok, index: children }));
                continue;
            }

            let occ = self.token_count.get(&prev_tok).copied().unwrap_or(0).checked_sub(1)?;
            self.fold_nested_counts(prev_tok, occ, false);
            self.token_count.insert(prev_tok, occ);
            self.referential_timestamp -= self.token_duration_at(prev_tok, occ);
            self.top = Some(Rc::new(FrameNode { parent: frame.parent.clone(), iterable: frame.iterable, index: prev_index }));
            return self.poll_cur_token();
        }
    }

    /// Explicit entry into the current token's block, regardless of
    /// unroll flags. No-op (returns `None`) if the current token isn't an
    /// iterable or is empty.
    pub fn enter_block(&mut self) -> Option<Token> {
        let cur_tok = self.poll_cur_token()?;
        if !matches!(cur_tok.kind(), TokenKind::Sequence | TokenKind::Loop) {
            return None;
        }
        if self.thread.child_count(cur_tok) == 0 {
            return None;
        }
        let frame = self.top.clone().unwrap();
        self.top = Some(Rc::new(FrameNode { parent: Some(frame), iterable: cur_tok, index: 0 }));
        self.poll_cur_token()
    }

    /// Explicit exit of the current block, discarding its frame. No-op at
    /// the root.
    pub fn leave_block(&mut self) {
        if let Some(frame) = &self.top {
            self.top = frame.parent.clone();
        }
    }

    /// Deep-copies the reader's position (an O(1) `Rc` clone of the
    /// callstack chain plus a clone of the occurrence-count map) so it can
    /// later be restored with [`ThreadReader::restore`].
    pub fn checkpoint(&self) -> Self {
        Self {
            thread: self.thread.clone(),
            top: self.top.clone(),
            token_count: self.token_count.clone(),
            referential_timestamp: self.referential_timestamp,
        }
    }

    /// Restores a previously taken checkpoint.
    pub fn restore(&mut self, snapshot: Self) {
        *self = snapshot;
    }

    /// Materialises the current token as an `Occurrence`, using the
    /// occurrence index implied by the current position.
    pub fn get_occurrence(&self) -> Option<Occurrence> {
        let tok = self.poll_cur_token()?;
        let occ = *self.token_count.get(&tok).unwrap_or(&0);
        Some(match tok.kind() {
            TokenKind::Event => Occurrence::Event { id: tok.id(), duration: self.token_duration(tok) },
            TokenKind::Sequence => {
                Occurrence::Sequence { id: tok.id(), duration: self.token_duration(tok) }
            }
            TokenKind::Loop => Occurrence::Loop {
                id: tok.id(),
                nb_iterations: self.thread.loops[tok.id() as usize].nb_iterations[occ],
            },
            TokenKind::Invalid => return None,
        })
    }

    /// Looks up the attribute list recorded for `occurrence_index` of
    /// event token `event_token`.
    pub fn get_event_attribute_list(
        &self,
        event_token: Token,
        occurrence_index: u64,
    ) -> crate::Result<Option<crate::event::AttributeList>> {
        assert_eq!(event_token.kind(), TokenKind::Event);
        self.thread.events[event_token.id() as usize].attribute_list(occurrence_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AttributeList, Event};
    use crate::params::Parameters;
    use crate::thread::ThreadId;
    use crate::thread_writer::{EventKind, ThreadWriter};

    fn build_scenario_b() -> Thread {
        let mut w = ThreadWriter::new(Thread::new(ThreadId(0)), Parameters::default());
        let mut ts = 0u64;
        let mut record = |w: &mut ThreadWriter, rec: u16| {
            ts += 10;
            w.store_event(EventKind::Atomic, Event::new(rec, vec![]), Some(ts), AttributeList::default());
        };
        for _ in 0..2 {
            record(&mut w, 1);
            record(&mut w, 2);
            record(&mut w, 3);
        }
        record(&mut w, 4);
        for _ in 0..2 {
            record(&mut w, 1);
            record(&mut w, 2);
            record(&mut w, 3);
        }
        w.thread_close()
    }

    #[test]
    fn forward_unroll_all_visits_every_event_in_order() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        let mut records = Vec::new();
        while let Some(tok) = reader.poll_cur_token() {
            if tok.kind() == TokenKind::Event {
                records.push(tok.id());
            }
            if reader.move_to_next_token(UnrollFlags::UNROLL_ALL).is_none() {
                break;
            }
        }
        // 7 events per half (1,2,3 x2 + 4 + 1,2,3 x2) -- actually 3*2+1+3*2=13
        assert_eq!(records.len(), 13);
    }

    /// Scenario D: step forward k times then backward k times returns to
    /// the initial state exactly.
    #[test]
    fn scenario_d_backward_iteration_is_symmetric() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        let initial_ts = reader.referential_timestamp;
        let initial_tok = reader.poll_cur_token();

        let k = 7;
        for _ in 0..k {
            reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        }
        for _ in 0..k {
            reader.move_to_prev_token(UnrollFlags::UNROLL_ALL);
        }

        assert_eq!(reader.referential_timestamp, initial_ts);
        assert_eq!(reader.poll_cur_token(), initial_tok);
    }

    #[test]
    fn checkpoint_restore_roundtrips() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        let snap = reader.checkpoint();
        reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        reader.restore(snap);
        assert_eq!(reader.poll_cur_token().unwrap().kind(), TokenKind::Event);
    }

    /// Backward motion must work from a state reached via checkpoint/restore,
    /// not just one reached by a forward walk (a plain undo stack can't do
    /// this, since `restore` doesn't replay history).
    #[test]
    fn backward_motion_after_checkpoint_restore() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        for _ in 0..4 {
            reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        }
        let snap = reader.checkpoint();
        for _ in 0..3 {
            reader.move_to_next_token(UnrollFlags::UNROLL_ALL);
        }
        reader.restore(snap);

        let before = reader.poll_cur_token();
        let ts_before = reader.referential_timestamp;
        assert!(reader.move_to_prev_token(UnrollFlags::UNROLL_ALL).is_some());
        assert!(reader.referential_timestamp < ts_before);
        assert!(reader.move_to_next_token(UnrollFlags::UNROLL_ALL).is_some());
        assert_eq!(reader.poll_cur_token(), before);
        assert_eq!(reader.referential_timestamp, ts_before);
    }

    /// Backward motion must also work after `enter_block`/`leave_block`,
    /// which move the callstack without touching any undo history.
    #[test]
    fn backward_motion_after_enter_and_leave_block() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        assert!(reader.enter_block().is_some());
        assert!(reader.enter_block().is_some());
        let ts_before = reader.referential_timestamp;
        reader.leave_block();

        assert!(reader.move_to_prev_token(UnrollFlags::UNROLL_ALL).is_some());
        assert_eq!(reader.referential_timestamp, ts_before);
    }

    /// Crossing a Sequence/Loop whole (not unrolled into) must still fold in
    /// the occurrence counts of every token nested inside it, so a later
    /// lookup for one of those nested tokens sees the right occurrence.
    #[test]
    fn no_unroll_cross_folds_nested_token_counts() {
        let thread = Arc::new(build_scenario_b());
        let mut reader = ThreadReader::new(thread);
        assert_eq!(reader.poll_cur_token().unwrap().kind(), TokenKind::Loop);
        reader.move_to_next_token(UnrollFlags::NO_UNROLL);

        let e1 = Token::new(TokenKind::Event, 0);
        assert_eq!(*reader.token_count.get(&e1).unwrap_or(&0), 2);
    }
}
