//! The 12-state literal/match history FSM.
//!
//! The state tracks what kind of symbols were coded recently (literals,
//! matches, reps, short reps) and selects which probability arrays gate the
//! next match/rep decisions. It carries no other information. The encoder
//! and the decoder must replay exactly the same transitions for the streams
//! to stay in sync, so these are kept as small total functions of the raw
//! state index.

/// State after coding a literal.
pub fn after_char(state: u32) -> u32 {
    if state < 4 {
        0
    } else if state < 10 {
        state - 3
    } else {
        state - 6
    }
}

/// State after coding a match with a new distance.
pub fn after_match(state: u32) -> u32 {
    if state < 7 { 7 } else { 10 }
}

/// State after coding a repeat match.
pub fn after_rep(state: u32) -> u32 {
    if state < 7 { 8 } else { 11 }
}

/// State after coding a 1-byte short rep.
pub fn after_short_rep(state: u32) -> u32 {
    if state < 7 { 9 } else { 11 }
}

/// True for states reached without an intervening match; literals coded from
/// these states use the plain (unmatched) literal mode.
pub fn is_char_state(state: u32) -> bool {
    state < 7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NUM_STATES;

    #[test]
    fn test_transitions_stay_in_range() {
        for s in 0..NUM_STATES {
            assert!(after_char(s) < NUM_STATES);
            assert!(after_match(s) < NUM_STATES);
            assert!(after_rep(s) < NUM_STATES);
            assert!(after_short_rep(s) < NUM_STATES);
        }
    }

    #[test]
    fn test_char_states_after_literal() {
        // Coding a literal always lands in a pure-char state.
        for s in 0..NUM_STATES {
            assert!(is_char_state(after_char(s)), "state {s}");
        }
    }

    #[test]
    fn test_match_states_are_not_char_states() {
        for s in 0..NUM_STATES {
            assert!(!is_char_state(after_match(s)));
            assert!(!is_char_state(after_rep(s)));
            assert!(!is_char_state(after_short_rep(s)));
        }
    }

    #[test]
    fn test_literal_run_converges_to_zero() {
        let mut s = 11;
        for _ in 0..3 {
            s = after_char(s);
        }
        assert_eq!(s, 0);
    }
}
