//! Online grammar builder: turns a stream of `store_event` calls into a
//! Thread's factored Sequences and Loops, converting timestamps to
//! durations as it goes.

use crate::event::{AttributeList, Event};
use crate::linked_vector::DurationHandle;
use crate::params::{LoopFindingAlgorithm, Parameters};
use crate::thread::Thread;
use crate::token::{Token, TokenKind};
use std::time::Instant;

/// Maximum nesting depth of open blocks. Exceeding it is a fatal-bug
/// condition (programmer error or corrupt recorder), per the error
/// taxonomy.
pub const MAX_CALLSTACK_DEPTH: usize = 128;

/// What a recorded event does to the writer's block nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A leaf event; does not open or close a block.
    Atomic,
    /// Opens a new nested block (e.g. an `Enter`).
    BlockStart,
    /// Closes the innermost open block (e.g. a `Leave`).
    BlockEnd,
}

/// Address of a duration cell still being tracked by the writer: which
/// per-thread array it lives in, and its stable handle within that array's
/// `LinkedDurationVector`.
#[derive(Clone, Copy)]
struct DurationRef {
    kind: TokenKind,
    id: u32,
    handle: DurationHandle,
}

/// Online per-thread grammar builder. Single-writer; holds no internal
/// locking on its hot path (see concurrency model).
pub struct ThreadWriter {
    thread: Thread,
    params: Parameters,
    /// Tokens accumulated so far at each open depth; index 0 is the
    /// thread's root sequence under construction.
    sequence_stack: Vec<Vec<Token>>,
    sequence_start_timestamp: Vec<u64>,
    last_timestamp: u64,
    /// Cell holding the most recent event/sequence's still-provisional
    /// timestamp, to be overwritten with a duration once the next
    /// timestamp arrives.
    last_duration: Option<DurationRef>,
    /// Duration cells belonging to enclosing sequences that couldn't be
    /// finalised when appended because the inner event's duration wasn't
    /// known yet.
    incomplete_durations: Vec<DurationRef>,
    first_instant: Option<Instant>,
}

impl ThreadWriter {
    /// Starts building a grammar on top of a fresh `Thread`.
    pub fn new(thread: Thread, params: Parameters) -> Self {
        Self {
            thread,
            params,
            sequence_stack: vec![Vec::new()],
            sequence_start_timestamp: vec![0],
            last_timestamp: 0,
            last_duration: None,
            incomplete_durations: Vec::new(),
            first_instant: None,
        }
    }

    /// Current nesting depth (0 = only the root sequence is open).
    pub fn cur_depth(&self) -> usize {
        self.sequence_stack.len() - 1
    }

    fn resolve_timestamp(&mut self, ts: Option<u64>) -> u64 {
        match ts {
            Some(t) => t,
            None => {
                let now = Instant::now();
                let anchor = *self.first_instant.get_or_insert(now);
                now.duration_since(anchor).as_nanos() as u64
            }
        }
    }

    /// Records one occurrence of `event`. `ts` is either an explicit
    /// timestamp (nanoseconds since the thread's first event) or `None` to
    /// sample the monotonic clock. Returns the event's occurrence index
    /// (0-based, per distinct event template).
    pub fn store_event(
        &mut self,
        kind: EventKind,
        event: Event,
        ts: Option<u64>,
        attrs: AttributeList,
    ) -> u64 {
        let ts = self.resolve_timestamp(ts);

        if kind == EventKind::BlockStart {
            assert!(
                self.sequence_stack.len() < MAX_CALLSTACK_DEPTH,
                "callstack overflow: depth exceeds {MAX_CALLSTACK_DEPTH}"
            );
            self.sequence_stack.push(Vec::new());
            self.sequence_start_timestamp.push(ts);
        }

        let event_id = self.thread.get_event_id(event);

        self.thread.events[event_id as usize].nb_occurrences += 1;
        let occurrence_index = self.thread.events[event_id as usize].nb_occurrences - 1;
        self.store_timestamp(TokenKind::Event, event_id, ts);

        let token = Token::new(TokenKind::Event, event_id);
        self.append_token(token);
        if !attrs.entries.is_empty() {
            self.thread.events[event_id as usize].record_attributes(occurrence_index, attrs);
        }

        if kind == EventKind::BlockEnd {
            self.close_sequence();
        }
        occurrence_index
    }

    /// Converts the running timestamp stream into durations: back-fills
    /// the previous cell with `ts - last_timestamp`, propagates that delta
    /// to any pending enclosing-sequence durations, then appends `ts`
    /// itself as the new (still provisional) cell.
    fn store_timestamp(&mut self, kind: TokenKind, id: u32, ts: u64) {
        if let Some(prev) = self.last_duration.take() {
            let delta = ts - self.last_timestamp;
            self.set_duration(prev, delta);
            for inc in std::mem::take(&mut self.incomplete_durations) {
                self.add_duration(inc, delta);
            }
        }
        let handle = match kind {
            TokenKind::Event => self.thread.events[id as usize].durations.add(ts),
            TokenKind::Sequence => self.thread.sequences[id as usize].durations.add(ts),
            other => panic!("store_timestamp: unexpected token kind {other:?}"),
        };
        self.last_duration = Some(DurationRef { kind, id, handle });
        self.last_timestamp = ts;
    }

    fn set_duration(&self, r: DurationRef, val: u64) {
        match r.kind {
            TokenKind::Event => self.thread.events[r.id as usize].durations.set(r.handle, val),
            TokenKind::Sequence => self.thread.sequences[r.id as usize].durations.set(r.handle, val),
            other => panic!("set_duration: unexpected token kind {other:?}"),
        }
    }

    fn add_duration(&self, r: DurationRef, delta: u64) {
        let vec = match r.kind {
            TokenKind::Event => &self.thread.events[r.id as usize].durations,
            TokenKind::Sequence => &self.thread.sequences[r.id as usize].durations,
            other => panic!("add_duration: unexpected token kind {other:?}"),
        };
        let cur = vec.get(r.handle);
        vec.set(r.handle, cur + delta);
    }

    fn append_token(&mut self, token: Token) {
        self.sequence_stack.last_mut().unwrap().push(token);
        self.detect_loop();
    }

    /// Closes the sequence at the current depth (§4.6): computes its
    /// duration from the bracketing timestamps, dedups it, pops the stack,
    /// and appends the resulting Sequence token to the new top frame.
    fn close_sequence(&mut self) {
        if self.cur_depth() == 0 {
            log::warn!("close_sequence called with no open block (unmatched Leave)");
            return;
        }
        let start_ts = self.sequence_start_timestamp.pop().unwrap();
        let duration = self.last_timestamp.saturating_sub(start_ts);
        let tokens = self.sequence_stack.pop().unwrap();
        let seq_id = self.thread.get_sequence_id_from_array(&tokens);
        self.thread.sequences[seq_id as usize].durations.add(duration);
        let seq_tok = Token::new(TokenKind::Sequence, seq_id);
        self.append_token(seq_tok);
    }

    /// Runs the configured loop detector once against the current frame's
    /// tail. Stops at the first successful factoring, per spec.
    fn detect_loop(&mut self) {
        match self.params.loop_finding_algorithm {
            LoopFindingAlgorithm::None => {}
            LoopFindingAlgorithm::Basic => self.find_loop_basic(usize::MAX),
            LoopFindingAlgorithm::BasicTruncated => {
                self.find_loop_basic(self.params.max_loop_length as usize)
            }
            LoopFindingAlgorithm::Filter => self.find_loop_filter(),
        }
    }

    /// Quadratic search: for every candidate length up to `max_loop_length`
    /// (exclusive), tries extending an existing Loop first, then factoring
    /// a fresh duplication.
    fn find_loop_basic(&mut self, max_loop_length: usize) {
        let cur_len = self.sequence_stack.last().unwrap().len();
        if cur_len == 0 {
            return;
        }
        let current_index = cur_len - 1;
        for l in 1..=current_index {
            if l >= max_loop_length {
                break;
            }
            if self.try_extend_loop(l) {
                return;
            }
            if self.try_fresh_duplication(l) {
                return;
            }
        }
    }

    /// Filters candidate lengths before searching: duplication can only
    /// close on a length whose earlier occurrence of the tail token lines
    /// up, and extension can only target a length that lands exactly on an
    /// existing Loop token — two independent scans, since neither implies
    /// the other.
    fn find_loop_filter(&mut self) {
        let cur = self.sequence_stack.last().unwrap().clone();
        if cur.is_empty() {
            return;
        }
        let current_index = cur.len() - 1;
        let last = cur[current_index];

        let duplication_lengths: Vec<usize> = (1..=current_index)
            .filter(|&l| cur[current_index - l] == last)
            .collect();
        for l in duplication_lengths {
            if self.try_fresh_duplication(l) {
                return;
            }
        }

        let extend_lengths: Vec<usize> = cur
            .iter()
            .enumerate()
            .filter(|(_, &tok)| tok.kind() == TokenKind::Loop)
            .map(|(i, _)| current_index - i)
            .filter(|&l| l > 0)
            .collect();
        for l in extend_lengths {
            if self.try_extend_loop(l) {
                return;
            }
        }
    }

    /// Step 1: if the token `l` positions before the tail is a Loop whose
    /// body already equals the last `l` tokens, fold the tail into one more
    /// iteration of that loop.
    fn try_extend_loop(&mut self, l: usize) -> bool {
        let (candidate, span) = {
            let cur = self.sequence_stack.last().unwrap();
            let k = cur.len() - 1;
            if k < l {
                return false;
            }
            (cur[k - l], cur[k - l + 1..=k].to_vec())
        };
        if candidate.kind() != TokenKind::Loop {
            return false;
        }
        let body_tok = self.thread.loops[candidate.id() as usize].repeated_token;
        if self.thread.sequences[body_tok.id() as usize].tokens != span {
            return false;
        }

        let duration = self.thread.get_sequence_duration(&span, true);
        let handle = self.thread.sequences[body_tok.id() as usize].durations.add(duration);
        self.incomplete_durations.push(DurationRef {
            kind: TokenKind::Sequence,
            id: body_tok.id(),
            handle,
        });
        *self.thread.loops[candidate.id() as usize].nb_iterations.last_mut().unwrap() += 1;

        let k = self.sequence_stack.last().unwrap().len() - 1;
        self.sequence_stack.last_mut().unwrap().truncate(k - l + 1);
        true
    }

    /// Step 2: if the `l` tokens before the tail equal the last `l` tokens,
    /// factor both halves into a fresh 2-iteration Loop.
    fn try_fresh_duplication(&mut self, l: usize) -> bool {
        let (combined, second_half, k) = {
            let cur = self.sequence_stack.last().unwrap();
            let len = cur.len();
            if len < 2 * l {
                return false;
            }
            let k = len - 1;
            if cur[k + 1 - 2 * l..=k - l] != cur[k + 1 - l..=k] {
                return false;
            }
            (cur[k + 1 - 2 * l..=k].to_vec(), cur[k + 1 - l..=k].to_vec(), k)
        };

        let seq_id = self.thread.get_sequence_id_from_array(&second_half);
        let seq_tok = Token::new(TokenKind::Sequence, seq_id);
        let loop_id = self.thread.new_loop(seq_tok);
        let loop_tok = Token::new(TokenKind::Loop, loop_id);

        // Duration of the whole two-iteration span minus the second
        // iteration's gives the first iteration's (already fully known).
        let duration_combined = self.thread.get_sequence_duration(&combined, true);
        let duration_second = self.thread.get_sequence_duration(&second_half, true);
        let first_iter_duration = duration_combined - duration_second;
        self.thread.sequences[seq_id as usize].durations.add(first_iter_duration);

        // Second iteration's last token is still provisional.
        let handle = self.thread.sequences[seq_id as usize].durations.add(duration_second);
        self.incomplete_durations.push(DurationRef {
            kind: TokenKind::Sequence,
            id: seq_id,
            handle,
        });

        self.thread.loops[loop_id as usize].nb_iterations.push(2);

        let new_len = k + 1 - 2 * l;
        let cur = self.sequence_stack.last_mut().unwrap();
        cur.truncate(new_len);
        cur.push(loop_tok);
        true
    }

    /// Force-closes any still-open blocks (logging each, per the
    /// recoverable-error taxonomy) then finalises the thread, consuming
    /// the writer and returning the completed `Thread` for storage.
    pub fn thread_close(mut self) -> Thread {
        while self.cur_depth() > 0 {
            log::warn!(
                "thread_close: force-closing an open block at depth {}",
                self.cur_depth()
            );
            self.close_sequence();
        }
        self.finalize()
    }

    fn finalize(mut self) -> Thread {
        let start_ts = self.sequence_start_timestamp[0];
        let duration = self.last_timestamp.saturating_sub(start_ts);
        let root_tokens = self.sequence_stack[0].clone();
        self.thread.sequences[0].hash = crate::sequence::hash_tokens(&root_tokens);
        self.thread.sequences[0].tokens = root_tokens;
        self.thread.sequences[0].invalidate_token_count();
        self.thread.sequences[0].durations.add(duration);
        self.thread.sequences[0].durations.final_update_stats();

        for summary in &mut self.thread.events {
            summary.durations.final_update_stats();
        }
        for seq in self.thread.sequences.iter_mut().skip(1) {
            seq.durations.final_update_stats();
        }

        self.thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;
    use crate::token::TokenKind;

    fn event(record: u16) -> Event {
        Event::new(record, vec![])
    }

    fn writer() -> ThreadWriter {
        ThreadWriter::new(Thread::new(ThreadId(0)), Parameters::default())
    }

    /// Scenario A: E1 E2 E3 E1 E2 E3 E1 E2 E3 factors into one Loop whose
    /// iteration count grows 2, then 3.
    #[test]
    fn scenario_a_basic_loop_detection() {
        let mut w = writer();
        let mut ts = 0u64;
        let mut record = |w: &mut ThreadWriter, rec: u16| {
            ts += 10;
            w.store_event(EventKind::Atomic, event(rec), Some(ts), AttributeList::default());
        };
        for _ in 0..2 {
            record(&mut w, 1);
            record(&mut w, 2);
            record(&mut w, 3);
        }
        {
            let cur = w.sequence_stack.last().unwrap();
            assert_eq!(cur.len(), 1);
            assert_eq!(cur[0].kind(), TokenKind::Loop);
            assert_eq!(w.thread.loops[cur[0].id() as usize].nb_iterations, vec![2]);
        }
        record(&mut w, 1);
        record(&mut w, 2);
        record(&mut w, 3);
        let cur = w.sequence_stack.last().unwrap();
        assert_eq!(cur.len(), 1);
        assert_eq!(w.thread.loops[cur[0].id() as usize].nb_iterations, vec![3]);
    }

    /// Scenario B: two E1 E2 E3 runs separated by E4 stay as two distinct
    /// Loop occurrences sharing the same body sequence.
    #[test]
    fn scenario_b_separated_loops() {
        let mut w = writer();
        let mut ts = 0u64;
        let mut record = |w: &mut ThreadWriter, rec: u16| {
            ts += 10;
            w.store_event(EventKind::Atomic, event(rec), Some(ts), AttributeList::default());
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
        let cur = w.sequence_stack.last().unwrap().clone();
        assert_eq!(cur.len(), 3);
        assert_eq!(cur[0].kind(), TokenKind::Loop);
        assert_eq!(cur[2].kind(), TokenKind::Loop);
        assert_ne!(cur[0], cur[2], "an interruption should start a fresh Loop occurrence");
        let body = w.thread.loops[cur[0].id() as usize].repeated_token;
        assert_eq!(body, w.thread.loops[cur[2].id() as usize].repeated_token);
        assert_eq!(w.thread.sequences[body.id() as usize].durations.size(), 4);
    }

    /// Scenario C: nested Enter/Leave blocks repeated 3 times collapse the
    /// inner body into one Sequence and the root into one Loop.
    #[test]
    fn scenario_c_nested_blocks() {
        let mut w = writer();
        let mut ts = 0u64;
        for _ in 0..3 {
            ts += 10;
            w.store_event(EventKind::BlockStart, event(10), Some(ts), AttributeList::default());
            ts += 10;
            w.store_event(EventKind::BlockStart, event(20), Some(ts), AttributeList::default());
            ts += 10;
            w.store_event(EventKind::BlockEnd, event(21), Some(ts), AttributeList::default());
            ts += 10;
            w.store_event(EventKind::BlockEnd, event(11), Some(ts), AttributeList::default());
        }
        let root = w.sequence_stack[0].clone();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].kind(), TokenKind::Loop);
        assert_eq!(w.thread.loops[root[0].id() as usize].nb_iterations, vec![3]);
    }

    #[test]
    fn thread_close_flushes_root_sequence() {
        let mut w = writer();
        w.store_event(EventKind::Atomic, event(1), Some(10), AttributeList::default());
        w.store_event(EventKind::Atomic, event(2), Some(20), AttributeList::default());
        let thread = w.thread_close();
        assert_eq!(thread.sequences[0].durations.size(), 1);
        assert_eq!(thread.events[0].durations.size(), 1);
    }
}
