use crate::tournament::{TournamentFormat, TournamentOptions};

/// One scheduled game: engine indices for the two colours, the round it
/// belongs to, its slot within the round, and the opening assigned to the
/// round (colour-swapped twins share it).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct Pairing {
    pub round: usize,
    pub game_in_round: usize,
    pub white: usize,
    pub black: usize,
    pub opening: usize,
}

/// The unit of scheduling: all games of one encounter between two engines.
/// With colour-swapped pairs this is the pentanomial unit.
#[derive(Debug, Clone, Eq, PartialEq)]
#[must_use]
pub struct RoundTask {
    pub round: usize,
    /// Engine indices in tournament order (first, second).
    pub pair: (usize, usize),
    pub games: Vec<Pairing>,
}

/// A lazy, deterministic stream of round tasks. Round-robin cycles every
/// unordered pair; gauntlet pairs each seed with every non-seed. One round
/// task is produced per (round, pair) combination, each with its own
/// opening index, until the configured number of rounds is exhausted.
#[derive(Debug)]
#[must_use]
pub struct PairingStream {
    pairs: Vec<(usize, usize)>,
    total_rounds: usize,
    games_per_round: usize,
    swap_colors: bool,
    reverse: bool,
    next: usize,
}

impl PairingStream {
    pub fn new(options: &TournamentOptions) -> Self {
        let n = options.engines.len();
        let pairs = match options.format {
            TournamentFormat::RoundRobin => {
                let mut pairs = vec![];
                for a in 0..n {
                    for b in a + 1..n {
                        pairs.push((a, b));
                    }
                }
                pairs
            }
            TournamentFormat::Gauntlet => {
                let seeds = options.gauntlet_seeds.max(1).min(n.saturating_sub(1));
                let mut pairs = vec![];
                for seed in 0..seeds {
                    for opponent in seeds..n {
                        pairs.push((seed, opponent));
                    }
                }
                pairs
            }
        };
        PairingStream {
            total_rounds: options.rounds * pairs.len(),
            pairs,
            games_per_round: options.games_per_round,
            swap_colors: options.swap_colors,
            reverse: options.reverse,
            next: 0,
        }
    }

    /// How many games this stream will produce in total.
    pub fn total_games(&self) -> usize {
        self.total_rounds * self.games_per_round
    }
}

impl Iterator for PairingStream {
    type Item = RoundTask;

    fn next(&mut self) -> Option<RoundTask> {
        if self.next >= self.total_rounds || self.pairs.is_empty() {
            return None;
        }
        let round = self.next;
        self.next += 1;
        let (first, second) = self.pairs[round % self.pairs.len()];
        let games = (0..self.games_per_round)
            .map(|game_in_round| {
                // the swap pair reverses colours on the second game and
                // reuses the round's opening; -reverse flips everything
                let mut swapped = self.swap_colors && game_in_round % 2 == 1;
                if self.reverse {
                    swapped = !swapped;
                }
                let (white, black) = if swapped { (second, first) } else { (first, second) };
                Pairing { round, game_in_round, white, black, opening: round }
            })
            .collect();
        Some(RoundTask { round, pair: (first, second), games })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::tournament::TournamentOptions;
    use std::sync::Arc;

    fn options(engines: usize) -> TournamentOptions {
        let mut options = TournamentOptions::default();
        options.engines = (0..engines)
            .map(|i| Arc::new(EngineConfig::new(&format!("engine{i}"), "nonexistent")))
            .collect();
        options
    }

    #[test]
    fn two_engine_swap_pairs() {
        let mut opts = options(2);
        opts.rounds = 3;
        opts.games_per_round = 2;
        let stream = PairingStream::new(&opts);
        assert_eq!(stream.total_games(), 6);
        let tasks: Vec<RoundTask> = stream.collect();
        assert_eq!(tasks.len(), 3);
        for (round, task) in tasks.iter().enumerate() {
            assert_eq!(task.round, round);
            assert_eq!(task.pair, (0, 1));
            assert_eq!(task.games.len(), 2);
            let [first, second] = task.games[..] else { panic!() };
            assert_eq!((first.white, first.black), (0, 1));
            assert_eq!((second.white, second.black), (1, 0));
            // the twin reuses the opening
            assert_eq!(first.opening, second.opening);
            assert_eq!(first.opening, round);
        }
    }

    #[test]
    fn noswap_repeats_colours() {
        let mut opts = options(2);
        opts.rounds = 1;
        opts.games_per_round = 2;
        opts.swap_colors = false;
        let tasks: Vec<RoundTask> = PairingStream::new(&opts).collect();
        let [first, second] = tasks[0].games[..] else { panic!() };
        assert_eq!((first.white, first.black), (0, 1));
        assert_eq!((second.white, second.black), (0, 1));
    }

    #[test]
    fn reverse_flips_the_initial_assignment() {
        let mut opts = options(2);
        opts.rounds = 1;
        opts.games_per_round = 2;
        opts.reverse = true;
        let tasks: Vec<RoundTask> = PairingStream::new(&opts).collect();
        let [first, second] = tasks[0].games[..] else { panic!() };
        assert_eq!((first.white, first.black), (1, 0));
        assert_eq!((second.white, second.black), (0, 1));
    }

    #[test]
    fn round_robin_cycles_every_unordered_pair() {
        let mut opts = options(3);
        opts.rounds = 2;
        opts.games_per_round = 1;
        let tasks: Vec<RoundTask> = PairingStream::new(&opts).collect();
        let pairs: Vec<(usize, usize)> = tasks.iter().map(|t| t.pair).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2), (0, 1), (0, 2), (1, 2)]);
        // every task advances the opening rotation
        let openings: Vec<usize> = tasks.iter().map(|t| t.games[0].opening).collect();
        assert_eq!(openings, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn gauntlet_pairs_seeds_against_the_field_only() {
        let mut opts = options(4);
        opts.rounds = 1;
        opts.games_per_round = 1;
        opts.format = TournamentFormat::Gauntlet;
        opts.gauntlet_seeds = 2;
        let pairs: Vec<(usize, usize)> =
            PairingStream::new(&opts).map(|t| t.pair).collect();
        // no (2, 3) pairing among the rest of the field
        assert_eq!(pairs, vec![(0, 2), (0, 3), (1, 2), (1, 3)]);
    }
}
