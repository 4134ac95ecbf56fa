//! A single thread's grammar: its distinct events, sequences, and loops,
//! plus the dedup lookups and structural queries the writer and reader
//! build on.

use crate::event::{Event, EventSummary};
use crate::sequence::{hash_tokens, Loop, Sequence};
use crate::token::{Token, TokenKind};
use rustc_hash::FxHashMap;

/// Dense id of a Thread within its owning Archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

/// One thread's grammar: distinct events, factored sequences, and loops.
/// Sequence #0 is reserved as the thread's root sequence (the whole trace).
pub struct Thread {
    /// This thread's id within its owning Archive.
    pub id: ThreadId,
    /// Distinct event templates seen on this thread.
    pub events: Vec<EventSummary>,
    /// Factored token substrings, sequence 0 is the root.
    pub sequences: Vec<Sequence>,
    /// Run-length-encoded adjacent sequence repetitions.
    pub loops: Vec<Loop>,
}

impl Thread {
    /// A fresh Thread with its reserved root sequence (id 0, empty tokens).
    pub fn new(id: ThreadId) -> Self {
        let mut sequences = Vec::new();
        sequences.push(Sequence::new(0, hash_tokens(&[]), Vec::new()));
        Self { id, events: Vec::new(), sequences, loops: Vec::new() }
    }

    /// Looks up (or creates) the `EventSummary` matching `event`'s full
    /// template bytes, per the byte-wise dedup key in spec.md §3.
    pub fn get_event_id(&mut self, event: Event) -> u32 {
        let template = event.template_bytes();
        for summary in &self.events {
            if summary.event.template_bytes() == template {
                return summary.id;
            }
        }
        let id = self.events.len() as u32;
        self.events.push(EventSummary::new(id, event));
        id
    }

    /// Looks up (or creates) the Sequence whose token vector equals
    /// `tokens`, via a hash-bucket scan. Hash collisions are logged and
    /// treated as misses (recoverable, per the error taxonomy).
    pub fn get_sequence_id_from_array(&mut self, tokens: &[Token]) -> u32 {
        let hash = hash_tokens(tokens);
        for seq in &self.sequences {
            if seq.hash == hash {
                if seq.tokens == tokens {
                    return seq.id;
                }
                log::warn!("sequence hash collision at hash {hash:#x}, treating as miss");
            }
        }
        let id = self.sequences.len() as u32;
        self.sequences.push(Sequence::new(id, hash, tokens.to_vec()));
        id
    }

    /// Creates a new Loop with the given repeated (body) token. Returns its
    /// token id.
    pub fn new_loop(&mut self, repeated_token: Token) -> u32 {
        let id = self.loops.len() as u32;
        let self_id = Token::new(TokenKind::Loop, id);
        self.loops.push(Loop::new(self_id, repeated_token));
        id
    }

    /// Returns the `i`-th child token of `iterable`. For a Sequence this is
    /// `tokens[i]`; for a Loop it is always the repeated body token,
    /// regardless of `i` (the loop body is a single sub-sequence per
    /// iteration). Out-of-range is a fatal-bug condition, per the error
    /// taxonomy.
    pub fn get_token(&self, iterable: Token, i: usize) -> Token {
        match iterable.kind() {
            TokenKind::Sequence => {
                let seq = &self.sequences[iterable.id() as usize];
                assert!(i < seq.tokens.len(), "sequence child index {i} out of range");
                seq.tokens[i]
            }
            TokenKind::Loop => {
                let lp = &self.loops[iterable.id() as usize];
                lp.repeated_token
            }
            other => panic!("get_token: {other:?} is not iterable"),
        }
    }

    /// Number of children of `iterable`: a Sequence's token count, or a
    /// Loop's iteration count at its current (last) occurrence.
    pub fn child_count(&self, iterable: Token) -> usize {
        match iterable.kind() {
            TokenKind::Sequence => self.sequences[iterable.id() as usize].tokens.len(),
            TokenKind::Loop => {
                let lp = &self.loops[iterable.id() as usize];
                *lp.nb_iterations.last().unwrap_or(&0) as usize
            }
            other => panic!("child_count: {other:?} is not iterable"),
        }
    }

    /// Counts every token reachable from `tok`'s children (recursively,
    /// unrolling loop iterations), merging into `counts`. Mirrors the
    /// recursive flattening `Sequence::getTokenCountWriting` performs so
    /// that a token nested inside a Sequence or Loop is skipped past
    /// correctly when an *earlier* occurrence of that same token is found
    /// later in the backward walk.
    pub(crate) fn accumulate_descendant_counts(&self, tok: Token, counts: &mut FxHashMap<Token, usize>) {
        match tok.kind() {
            TokenKind::Sequence => {
                let seq = &self.sequences[tok.id() as usize];
                for &child in &seq.tokens {
                    *counts.entry(child).or_insert(0) += 1;
                    self.accumulate_descendant_counts(child, counts);
                }
            }
            TokenKind::Loop => {
                let lp = &self.loops[tok.id() as usize];
                let n = *lp.nb_iterations.last().unwrap_or(&0) as usize;
                let body = lp.repeated_token;
                let mut nested = FxHashMap::default();
                self.accumulate_descendant_counts(body, &mut nested);
                for (k, v) in nested {
                    *counts.entry(k).or_insert(0) += v * n;
                }
                *counts.entry(body).or_insert(0) += n;
            }
            TokenKind::Event | TokenKind::Invalid => {}
        }
    }

    /// Total duration of a token span, walking it backwards while keeping a
    /// local per-token occurrence count (so each token's *correct*
    /// historical duration entry is picked, not always the latest). When
    /// `ignore_last` is set, the final token in `tokens` contributes 0 (its
    /// duration is still provisional and tracked separately as an
    /// incomplete duration).
    pub fn get_sequence_duration(&self, tokens: &[Token], ignore_last: bool) -> u64 {
        let mut counts: FxHashMap<Token, usize> = FxHashMap::default();
        let mut total = 0u64;
        let last = tokens.len().wrapping_sub(1);
        for (i, &tok) in tokens.iter().enumerate().rev() {
            *counts.entry(tok).or_insert(0) += 1;
            if ignore_last && i == last {
                continue;
            }
            match tok.kind() {
                TokenKind::Event => {
                    let summary = &self.events[tok.id() as usize];
                    let count = counts[&tok];
                    total += summary.durations.at(summary.durations.size() - count);
                }
                TokenKind::Sequence => {
                    let seq = &self.sequences[tok.id() as usize];
                    let count = counts[&tok];
                    total += seq.durations.at(seq.durations.size() - count);
                    self.accumulate_descendant_counts(tok, &mut counts);
                }
                TokenKind::Loop => {
                    let lp = &self.loops[tok.id() as usize];
                    let count = counts[&tok];
                    let nb_iterations = lp.nb_iterations[lp.nb_iterations.len() - count] as usize;
                    let body = lp.repeated_token;
                    let body_seq = &self.sequences[body.id() as usize];
                    for _ in 0..nb_iterations {
                        *counts.entry(body).or_insert(0) += 1;
                        let c = counts[&body];
                        total += body_seq.durations.at(body_seq.durations.size() - c);
                    }
                    let mut nested = FxHashMap::default();
                    self.accumulate_descendant_counts(body, &mut nested);
                    for (k, v) in nested {
                        *counts.entry(k).or_insert(0) += v * nb_iterations;
                    }
                }
                TokenKind::Invalid => {}
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn event_dedup_returns_same_id() {
        let mut t = Thread::new(ThreadId(0));
        let a = t.get_event_id(Event::new(1, vec![1, 2]));
        let b = t.get_event_id(Event::new(1, vec![1, 2]));
        let c = t.get_event_id(Event::new(1, vec![1, 3]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sequence_dedup_returns_same_id() {
        let mut t = Thread::new(ThreadId(0));
        let e1 = Token::new(TokenKind::Event, 0);
        let e2 = Token::new(TokenKind::Event, 1);
        let a = t.get_sequence_id_from_array(&[e1, e2]);
        let b = t.get_sequence_id_from_array(&[e1, e2]);
        let c = t.get_sequence_id_from_array(&[e2, e1]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // id 0 is reserved for the root sequence.
        assert_ne!(a, 0);
    }

    #[test]
    fn get_token_dispatches_by_kind() {
        let mut t = Thread::new(ThreadId(0));
        let e1 = Token::new(TokenKind::Event, 0);
        let e2 = Token::new(TokenKind::Event, 1);
        let seq_id = t.get_sequence_id_from_array(&[e1, e2]);
        let seq_tok = Token::new(TokenKind::Sequence, seq_id);
        assert_eq!(t.get_token(seq_tok, 0), e1);
        assert_eq!(t.get_token(seq_tok, 1), e2);

        let loop_id = t.new_loop(seq_tok);
        let loop_tok = Token::new(TokenKind::Loop, loop_id);
        assert_eq!(t.get_token(loop_tok, 0), seq_tok);
        assert_eq!(t.get_token(loop_tok, 5), seq_tok);
    }

    #[test]
    fn sequence_duration_sums_event_durations() {
        let mut t = Thread::new(ThreadId(0));
        let e1 = Token::new(TokenKind::Event, t.get_event_id(Event::new(1, vec![])));
        let e2 = Token::new(TokenKind::Event, t.get_event_id(Event::new(2, vec![])));
        t.events[e1.id() as usize].durations.add(10);
        t.events[e1.id() as usize].durations.final_update_stats();
        t.events[e2.id() as usize].durations.add(20);
        t.events[e2.id() as usize].durations.final_update_stats();
        let total = t.get_sequence_duration(&[e1, e2], false);
        assert_eq!(total, 30);
    }
}
