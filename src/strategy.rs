//! Deterministic selectors, parameterised by an RNG.
//!
//! Every function here is pure: the same snapshot fields and the same RNG
//! state give the same choice. "Nothing to pick" is `None`, never an error.

use rand::Rng;

use crate::actions::StakeDecision;
use crate::snapshot::{Selectable, StakeBounds, StakeModes, ThemeInfo};

/// Pick a stake: pass when allowed, otherwise a random stepped amount within
/// the bounds, otherwise all-in.
///
/// The amount is `min + step * floor(r * (max - min) / step)` with `r` drawn
/// from `[0, 1)`; a non-positive step or empty range yields `min`.
pub fn select_stake<R: Rng>(bounds: &StakeBounds, rng: &mut R) -> Option<StakeDecision> {
    if bounds.modes.contains(StakeModes::PASS) {
        return Some(StakeDecision::Pass);
    }
    if bounds.modes.contains(StakeModes::STAKE) {
        return Some(StakeDecision::Stake(stake_amount(bounds, rng.random::<f64>())));
    }
    if bounds.modes.contains(StakeModes::ALL_IN) {
        return Some(StakeDecision::AllIn);
    }
    None
}

fn stake_amount(bounds: &StakeBounds, r: f64) -> i32 {
    if bounds.step <= 0 || bounds.maximum <= bounds.minimum {
        return bounds.minimum;
    }
    let span = f64::from(bounds.maximum - bounds.minimum) / f64::from(bounds.step);
    let steps = (r * span).floor() as i32;
    bounds
        .minimum
        .saturating_add(bounds.step.saturating_mul(steps))
        .min(bounds.maximum)
}

/// Index of a uniformly chosen selectable candidate.
pub fn select_index<T: Selectable, R: Rng>(candidates: &[T], rng: &mut R) -> Option<usize> {
    let selectable: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_selectable())
        .map(|(i, _)| i)
        .collect();
    pick(&selectable, rng)
}

/// A uniformly chosen selectable candidate.
pub fn select_target<'a, T: Selectable, R: Rng>(candidates: &'a [T], rng: &mut R) -> Option<&'a T> {
    select_index(candidates, rng).and_then(|i| candidates.get(i))
}

/// `(theme, question)` of a uniformly chosen unplayed question.
pub fn select_question<R: Rng>(themes: &[ThemeInfo], rng: &mut R) -> Option<(usize, usize)> {
    let cells: Vec<(usize, usize)> = themes
        .iter()
        .enumerate()
        .flat_map(|(t, theme)| {
            theme
                .questions
                .iter()
                .enumerate()
                .filter(|(_, price)| **price >= 0)
                .map(move |(q, _)| (t, q))
        })
        .collect();
    pick(&cells, rng)
}

/// Index of a uniformly chosen theme that is still on the stack.
pub fn select_theme<R: Rng>(themes: &[ThemeInfo], rng: &mut R) -> Option<usize> {
    let remaining: Vec<usize> = themes
        .iter()
        .enumerate()
        .filter(|(_, theme)| !theme.name.trim().is_empty())
        .map(|(i, _)| i)
        .collect();
    pick(&remaining, rng)
}

fn pick<T: Copy, R: Rng>(items: &[T], rng: &mut R) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    items.get(rng.random_range(0..items.len())).copied()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::snapshot::{AnswerOption, ItemState, PlayerCandidate};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bounds(modes: StakeModes) -> StakeBounds {
        StakeBounds {
            minimum: 100,
            maximum: 1000,
            step: 100,
            modes,
        }
    }

    #[test]
    fn pass_wins_when_permitted() {
        let mut rng = StdRng::seed_from_u64(1);
        let all = StakeModes::STAKE.with(StakeModes::PASS).with(StakeModes::ALL_IN);
        assert_eq!(select_stake(&bounds(all), &mut rng), Some(StakeDecision::Pass));
    }

    #[test]
    fn stake_is_stepped_and_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let modes = StakeModes::STAKE.with(StakeModes::ALL_IN);
        for _ in 0..200 {
            match select_stake(&bounds(modes), &mut rng) {
                Some(StakeDecision::Stake(amount)) => {
                    assert!((100..=1000).contains(&amount));
                    assert_eq!((amount - 100) % 100, 0);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn stake_amount_formula() {
        let b = bounds(StakeModes::STAKE);
        assert_eq!(stake_amount(&b, 0.0), 100);
        assert_eq!(stake_amount(&b, 0.5), 500);
        assert_eq!(stake_amount(&b, 0.999), 900);
        let zero_step = StakeBounds { step: 0, ..b };
        assert_eq!(stake_amount(&zero_step, 0.7), 100);
    }

    #[test]
    fn all_in_is_the_last_resort() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            select_stake(&bounds(StakeModes::ALL_IN), &mut rng),
            Some(StakeDecision::AllIn)
        );
        assert_eq!(select_stake(&bounds(StakeModes::NONE), &mut rng), None);
    }

    #[test]
    fn targets_skip_unselectable_candidates() {
        let mut rng = StdRng::seed_from_u64(11);
        let players = vec![
            PlayerCandidate {
                name: "A".into(),
                can_be_selected: false,
            },
            PlayerCandidate {
                name: "B".into(),
                can_be_selected: true,
            },
        ];
        for _ in 0..20 {
            assert_eq!(select_target(&players, &mut rng).unwrap().name, "B");
        }

        let options = vec![AnswerOption {
            label: "A".into(),
            text: "x".into(),
            state: ItemState::Wrong,
        }];
        assert_eq!(select_index(&options, &mut rng), None);
        assert_eq!(select_index::<PlayerCandidate, _>(&[], &mut rng), None);
    }

    #[test]
    fn played_questions_and_removed_themes_are_skipped() {
        let mut rng = StdRng::seed_from_u64(5);
        let themes = vec![
            ThemeInfo {
                name: "History".into(),
                questions: vec![-1, -1],
            },
            ThemeInfo {
                name: String::new(),
                questions: vec![-1, 400],
            },
        ];
        assert_eq!(select_question(&themes, &mut rng), Some((1, 1)));
        assert_eq!(select_theme(&themes, &mut rng), Some(0));

        let played = vec![ThemeInfo {
            name: "Geo".into(),
            questions: vec![-1],
        }];
        assert_eq!(select_question(&played, &mut rng), None);
    }
}
