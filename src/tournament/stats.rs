use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::common::Res;
use crate::play::GameOutcome;

const PENTA_SCORES: [f64; 5] = [0.0, 0.25, 0.5, 0.75, 1.0];
const TRI_SCORES: [f64; 3] = [1.0, 0.5, 0.0];

/// nElo scale factor, `800 / ln 10`.
const NELO_DIVIDED_BY_NT: f64 = 347.435_885_522_601_46;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, EnumString, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum SprtModel {
    #[default]
    Logistic,
    Bayesian,
    Normalized,
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[must_use]
pub struct SprtOptions {
    pub alpha: f64,
    pub beta: f64,
    pub elo0: f64,
    pub elo1: f64,
    pub model: SprtModel,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SprtVerdict {
    /// H0 accepted: the tested engine is not stronger than `elo0`.
    AcceptH0,
    /// H1 accepted: the tested engine is at least `elo1` stronger.
    AcceptH1,
    Continue,
}

/// The sequential test between `H0: elo = elo0` and `H1: elo = elo1`.
#[derive(Debug, Copy, Clone)]
#[must_use]
pub struct Sprt {
    pub options: SprtOptions,
    pub lower: f64,
    pub upper: f64,
}

impl Sprt {
    pub fn new(options: SprtOptions) -> Res<Self> {
        if !(options.alpha > 0.0 && options.alpha < 1.0) {
            bail!("SPRT: alpha must be a decimal number between 0 and 1!")
        }
        if !(options.beta > 0.0 && options.beta < 1.0) {
            bail!("SPRT: beta must be a decimal number between 0 and 1!")
        }
        if options.alpha + options.beta >= 1.0 {
            bail!("SPRT: sum of alpha and beta must be less than 1!")
        }
        if options.elo0 >= options.elo1 {
            bail!("SPRT: elo0 must be less than elo1!")
        }
        Ok(Sprt {
            options,
            lower: (options.beta / (1.0 - options.alpha)).ln(),
            upper: ((1.0 - options.beta) / options.alpha).ln(),
        })
    }

    /// The running log-likelihood ratio over the counts collected so far.
    /// The empirical frequencies are regularised (half a count per cell) so
    /// one-sided streams don't degenerate to zero variance.
    pub fn llr(&self, cells: &PairCells, penta: bool) -> f64 {
        match self.options.model {
            SprtModel::Logistic if penta => {
                gsprt_llr(&regularized(&cells.penta, &PENTA_SCORES), self.elo_bounds())
            }
            SprtModel::Logistic => {
                gsprt_llr(&regularized(&cells.tri(), &TRI_SCORES), self.elo_bounds())
            }
            SprtModel::Bayesian => bayesian_llr(&cells.tri(), self.options.elo0, self.options.elo1),
            SprtModel::Normalized if penta => {
                normalized_llr(&regularized(&cells.penta, &PENTA_SCORES), self.nelo_bounds())
            }
            SprtModel::Normalized => {
                normalized_llr(&regularized(&cells.tri(), &TRI_SCORES), self.nelo_bounds())
            }
        }
    }

    pub fn verdict(&self, cells: &PairCells, penta: bool) -> SprtVerdict {
        let llr = self.llr(cells, penta);
        if llr >= self.upper {
            SprtVerdict::AcceptH1
        } else if llr <= self.lower {
            SprtVerdict::AcceptH0
        } else {
            SprtVerdict::Continue
        }
    }

    fn elo_bounds(&self) -> (f64, f64) {
        (elo_to_score(self.options.elo0), elo_to_score(self.options.elo1))
    }

    fn nelo_bounds(&self) -> (f64, f64) {
        (
            self.options.elo0 / NELO_DIVIDED_BY_NT,
            self.options.elo1 / NELO_DIVIDED_BY_NT,
        )
    }
}

/// Empirical sample distribution: the total count, per-game mean and
/// per-sample variance of the observed outcome frequencies.
#[derive(Debug, Copy, Clone)]
struct SampleDist {
    samples: f64,
    mean: f64,
    var: f64,
}

fn distribution(counts: &[u64], scores: &[f64]) -> SampleDist {
    let samples: u64 = counts.iter().sum();
    if samples == 0 {
        return SampleDist { samples: 0.0, mean: 0.5, var: 0.0 };
    }
    let n = samples as f64;
    let mean: f64 = counts
        .iter()
        .zip(scores)
        .map(|(&c, &s)| c as f64 / n * s)
        .sum();
    let var: f64 = counts
        .iter()
        .zip(scores)
        .map(|(&c, &s)| c as f64 / n * (s - mean) * (s - mean))
        .sum();
    SampleDist { samples: n, mean, var }
}

/// Like [`distribution`], but with half a count added to every cell. The
/// sample count stays the real one; only the frequencies are smoothed.
fn regularized(counts: &[u64], scores: &[f64]) -> SampleDist {
    let samples: u64 = counts.iter().sum();
    if samples == 0 {
        return SampleDist { samples: 0.0, mean: 0.5, var: 0.0 };
    }
    let total = samples as f64 + 0.5 * counts.len() as f64;
    let mean: f64 = counts
        .iter()
        .zip(scores)
        .map(|(&c, &s)| (c as f64 + 0.5) / total * s)
        .sum();
    let var: f64 = counts
        .iter()
        .zip(scores)
        .map(|(&c, &s)| (c as f64 + 0.5) / total * (s - mean) * (s - mean))
        .sum();
    SampleDist { samples: samples as f64, mean, var }
}

pub fn elo_to_score(elo: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf(-elo / 400.0))
}

pub fn score_to_elo(score: f64) -> f64 {
    let clamped = score.clamp(1e-9, 1.0 - 1e-9);
    -400.0 * (1.0 / clamped - 1.0).log10()
}

/// The generalised SPRT approximation over the empirical outcome
/// frequencies: `N (s1 - s0) (2 mean - s0 - s1) / (2 var)`.
fn gsprt_llr(dist: &SampleDist, (s0, s1): (f64, f64)) -> f64 {
    if dist.samples == 0.0 || dist.var <= 0.0 {
        return 0.0;
    }
    dist.samples * (s1 - s0) * (2.0 * dist.mean - s0 - s1) / (2.0 * dist.var)
}

/// Normalized-elo variant: the hypotheses are t-values, scaled back into
/// score space by the observed per-sample deviation.
fn normalized_llr(dist: &SampleDist, (t0, t1): (f64, f64)) -> f64 {
    if dist.samples == 0.0 || dist.var <= 0.0 {
        return 0.0;
    }
    let sigma = dist.var.sqrt();
    let s0 = 0.5 + t0 * sigma;
    let s1 = 0.5 + t1 * sigma;
    dist.samples * (s1 - s0) * (2.0 * dist.mean - s0 - s1) / (2.0 * dist.var)
}

/// The BayesElo model over trinomial counts, with the draw rating estimated
/// from the observed frequencies.
fn bayesian_llr(tri: &[u64; 3], elo0: f64, elo1: f64) -> f64 {
    let [wins, draws, losses] = *tri;
    // without all three outcomes the draw model is degenerate
    if wins == 0 || draws == 0 || losses == 0 {
        return 0.0;
    }
    let games = (wins + draws + losses) as f64;
    let p_win = wins as f64 / games;
    let p_loss = losses as f64 / games;
    let draw_elo = 200.0 * ((1.0 - p_loss) / p_loss * (1.0 - p_win) / p_win).log10();
    let scale =
        4.0 * 10f64.powf(-draw_elo / 400.0) / (1.0 + 10f64.powf(-draw_elo / 400.0)).powi(2);
    let (pw0, pd0, pl0) = bayeselo_to_proba(elo0 / scale, draw_elo);
    let (pw1, pd1, pl1) = bayeselo_to_proba(elo1 / scale, draw_elo);
    wins as f64 * (pw1 / pw0).ln() + draws as f64 * (pd1 / pd0).ln() + losses as f64 * (pl1 / pl0).ln()
}

fn bayeselo_to_proba(elo: f64, draw_elo: f64) -> (f64, f64, f64) {
    let p_win = 1.0 / (1.0 + 10f64.powf((-elo + draw_elo) / 400.0));
    let p_loss = 1.0 / (1.0 + 10f64.powf((elo + draw_elo) / 400.0));
    (p_win, 1.0 - p_win - p_loss, p_loss)
}

/// Abramowitz-Stegun rational approximation, good to ~1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let y = 1.0
        - (((((1.061_405_429 * t - 1.453_152_027) * t) + 1.421_413_741) * t - 0.284_496_736) * t
            + 0.254_829_592)
            * t
            * (-x * x).exp();
    sign * y
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// The running counters of one engine pair, from the first engine's point
/// of view. Game-level W/D/L always accumulates; the pentanomial cells only
/// gain an entry when both games of a colour-swapped pair completed.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
#[must_use]
pub struct PairCells {
    pub wins: u64,
    pub draws: u64,
    pub losses: u64,
    /// `[LL, LD, LW+DD, WD, WW]` over swap pairs.
    pub penta: [u64; 5],
    pub pairs: u64,
}

impl PairCells {
    pub fn games(&self) -> u64 {
        self.wins + self.draws + self.losses
    }

    pub fn tri(&self) -> [u64; 3] {
        [self.wins, self.draws, self.losses]
    }

    fn add_game(&mut self, points: f64) {
        if points > 0.75 {
            self.wins += 1;
        } else if points < 0.25 {
            self.losses += 1;
        } else {
            self.draws += 1;
        }
    }

    fn add_pair(&mut self, points: f64) {
        // a pair's total points (0, 0.5, 1, 1.5, 2) indexes the cell
        let cell = (points * 2.0).round() as usize;
        self.penta[cell.min(4)] += 1;
        self.pairs += 1;
    }

    /// Score rate, Elo estimate and its 95% interval, and the likelihood of
    /// superiority, from whichever distribution has data.
    pub fn estimate(&self, penta: bool) -> EloEstimate {
        let dist = if penta && self.pairs > 0 {
            distribution(&self.penta, &PENTA_SCORES)
        } else {
            distribution(&self.tri(), &TRI_SCORES)
        };
        if dist.samples == 0.0 || dist.var <= 0.0 {
            return EloEstimate::default();
        }
        let stderr = (dist.var / dist.samples).sqrt();
        let margin = 1.96 * stderr;
        EloEstimate {
            score: dist.mean,
            elo: score_to_elo(dist.mean),
            elo_error: (score_to_elo(dist.mean + margin) - score_to_elo(dist.mean - margin)).abs()
                / 2.0,
            los: normal_cdf((dist.mean - 0.5) / stderr),
            draw_ratio: self.draws as f64 / self.games().max(1) as f64,
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
#[must_use]
pub struct EloEstimate {
    pub score: f64,
    pub elo: f64,
    pub elo_error: f64,
    pub los: f64,
    pub draw_ratio: f64,
}

/// One completed scheduling unit, as reported to the aggregator: the engine
/// pair and the counted outcome of each game from white's perspective,
/// along with which engine had white.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub pair: (usize, usize),
    /// `(first_engine_had_white, outcome)`; `None` outcomes were interrupted.
    pub games: Vec<(bool, Option<GameOutcome>)>,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[must_use]
pub struct PairEntry {
    pub first: usize,
    pub second: usize,
    pub cells: PairCells,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[must_use]
pub struct StatsSnapshot {
    /// One entry per engine pair, in first-encounter order.
    pub pairs: Vec<PairEntry>,
    pub finished_games: u64,
    pub interrupted_games: u64,
    pub finished_rounds: u64,
}

impl StatsSnapshot {
    pub fn cells(&self, pair: (usize, usize)) -> PairCells {
        self.pairs
            .iter()
            .find(|e| (e.first, e.second) == pair)
            .map(|e| e.cells)
            .unwrap_or_default()
    }

    fn cells_mut(&mut self, pair: (usize, usize)) -> &mut PairCells {
        if let Some(idx) = self.pairs.iter().position(|e| (e.first, e.second) == pair) {
            return &mut self.pairs[idx].cells;
        }
        self.pairs.push(PairEntry { first: pair.0, second: pair.1, cells: PairCells::default() });
        &mut self.pairs.last_mut().unwrap().cells
    }
}

/// Thread-safe accumulation of results and the SPRT stop signal. All
/// updates go through one mutex; readers get value snapshots.
#[derive(Debug)]
pub struct StatsAggregator {
    inner: Mutex<StatsSnapshot>,
    sprt: Option<Sprt>,
    report_penta: bool,
}

impl StatsAggregator {
    pub fn new(sprt: Option<Sprt>, report_penta: bool) -> Self {
        StatsAggregator { inner: Mutex::new(StatsSnapshot::default()), sprt, report_penta }
    }

    pub fn sprt(&self) -> Option<&Sprt> {
        self.sprt.as_ref()
    }

    pub fn report_penta(&self) -> bool {
        self.report_penta
    }

    /// Folds one finished round into the counts. Interrupted games are
    /// tallied for the transcript but excluded from every statistic, and a
    /// pair with an interrupted half contributes no pentanomial cell.
    pub fn record_round(&self, record: &RoundRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished_rounds += 1;
        let cells = inner.cells_mut(record.pair);
        let mut pair_points = 0.0;
        let mut counted = 0usize;
        let mut interrupted = 0u64;
        for (first_is_white, outcome) in &record.games {
            let Some(outcome) = outcome else {
                interrupted += 1;
                continue;
            };
            let points = if *first_is_white {
                outcome.points_for(shakmaty::Color::White)
            } else {
                outcome.points_for(shakmaty::Color::Black)
            };
            cells.add_game(points);
            pair_points += points;
            counted += 1;
        }
        if counted == 2 && record.games.len() == 2 {
            cells.add_pair(pair_points / 2.0);
        }
        inner.finished_games += counted as u64;
        inner.interrupted_games += interrupted;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().unwrap().clone()
    }

    /// The SPRT verdict over the first engine pair, if a test is configured.
    pub fn sprt_verdict(&self) -> SprtVerdict {
        let Some(sprt) = &self.sprt else {
            return SprtVerdict::Continue;
        };
        let snapshot = self.inner.lock().unwrap();
        let cells = snapshot.cells((0, 1));
        let penta = self.report_penta && cells.pairs > 0;
        sprt.verdict(&cells, penta)
    }

    /// Restores counts from an autosave checkpoint.
    pub fn restore(&self, snapshot: StatsSnapshot) {
        *self.inner.lock().unwrap() = snapshot;
    }
}

impl Display for SprtVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SprtVerdict::AcceptH0 => write!(f, "H0 was accepted"),
            SprtVerdict::AcceptH1 => write!(f, "H1 was accepted"),
            SprtVerdict::Continue => write!(f, "test continues"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::GameOutcome::{BlackWin, Draw, WhiteWin};

    fn sprt(model: SprtModel) -> Sprt {
        Sprt::new(SprtOptions { alpha: 0.05, beta: 0.05, elo0: 0.0, elo1: 5.0, model }).unwrap()
    }

    #[test]
    fn construction_validates_the_configuration() {
        let valid = SprtOptions {
            alpha: 0.05,
            beta: 0.05,
            elo0: -1.5,
            elo1: 5.0,
            model: SprtModel::Logistic,
        };
        assert!(Sprt::new(valid).is_ok());
        assert!(Sprt::new(SprtOptions { alpha: 1.05, ..valid }).is_err());
        assert!(Sprt::new(SprtOptions { beta: 1.05, ..valid }).is_err());
        assert!(Sprt::new(SprtOptions { alpha: 0.55, beta: 0.55, ..valid }).is_err());
        assert!(Sprt::new(SprtOptions { elo0: 5.0, elo1: -1.5, ..valid }).is_err());
        let boundaries = Sprt::new(valid).unwrap();
        assert!(boundaries.lower < 0.0 && boundaries.upper > 0.0);
        assert!((boundaries.upper - (0.95f64 / 0.05).ln()).abs() < 1e-12);
    }

    fn record(aggregator: &StatsAggregator, outcomes: &[(GameOutcome, GameOutcome)]) {
        for (first, second) in outcomes {
            aggregator.record_round(&RoundRecord {
                pair: (0, 1),
                games: vec![(true, Some(*first)), (false, Some(*second))],
            });
        }
    }

    #[test]
    fn winning_streams_drive_the_llr_to_the_upper_bound() {
        for model in [SprtModel::Logistic, SprtModel::Normalized] {
            let aggregator = StatsAggregator::new(Some(sprt(model)), true);
            let mut last = 0.0;
            let mut crossed = false;
            // the first engine wins with white and draws with black, forever
            for _ in 0..200 {
                record(&aggregator, &[(WhiteWin, Draw)]);
                let cells = aggregator.snapshot().cells((0, 1));
                let llr = sprt(model).llr(&cells, true);
                assert!(llr >= last - 1e-9, "LLR must tend towards the boundary");
                last = llr;
                if aggregator.sprt_verdict() == SprtVerdict::AcceptH1 {
                    crossed = true;
                    break;
                }
            }
            assert!(crossed, "a one-sided stream must cross the H1 boundary ({model})");
        }
    }

    #[test]
    fn losing_streams_accept_h0() {
        let aggregator = StatsAggregator::new(Some(sprt(SprtModel::Logistic)), true);
        let mut crossed = false;
        for _ in 0..200 {
            record(&aggregator, &[(BlackWin, Draw)]);
            if aggregator.sprt_verdict() == SprtVerdict::AcceptH0 {
                crossed = true;
                break;
            }
        }
        assert!(crossed);
    }

    #[test]
    fn bayesian_llr_moves_with_the_results() {
        let cells_up = {
            let aggregator = StatsAggregator::new(None, false);
            record(&aggregator, &[(WhiteWin, Draw), (WhiteWin, WhiteWin), (WhiteWin, Draw)]);
            aggregator.snapshot().cells((0, 1))
        };
        let test = sprt(SprtModel::Bayesian);
        assert!(test.llr(&cells_up, false) > 0.0);
        let cells_down = {
            let aggregator = StatsAggregator::new(None, false);
            record(&aggregator, &[(BlackWin, Draw), (BlackWin, BlackWin), (BlackWin, Draw)]);
            aggregator.snapshot().cells((0, 1))
        };
        assert!(test.llr(&cells_down, false) < 0.0);
    }

    #[test]
    fn pentanomial_cells_count_pairs_not_games() {
        let aggregator = StatsAggregator::new(None, true);
        record(&aggregator, &[(WhiteWin, Draw)]);
        let cells = aggregator.snapshot().cells((0, 1));
        // first engine: win with white (1.0) + draw with black (0.5) = WD
        assert_eq!(cells.penta, [0, 0, 0, 1, 0]);
        assert_eq!(cells.wins, 1);
        assert_eq!(cells.draws, 1);
        assert_eq!(cells.pairs, 1);

        // second round: first engine loses both
        record(&aggregator, &[(BlackWin, WhiteWin)]);
        let cells = aggregator.snapshot().cells((0, 1));
        assert_eq!(cells.penta, [1, 0, 0, 1, 0]);
        assert_eq!(cells.losses, 2);
    }

    #[test]
    fn interrupted_games_are_excluded_from_statistics() {
        let aggregator = StatsAggregator::new(None, true);
        aggregator.record_round(&RoundRecord {
            pair: (0, 1),
            games: vec![(true, Some(WhiteWin)), (false, None)],
        });
        let snapshot = aggregator.snapshot();
        let cells = snapshot.cells((0, 1));
        assert_eq!(cells.wins, 1);
        assert_eq!(cells.pairs, 0, "a half-played pair is no pentanomial unit");
        assert_eq!(snapshot.finished_games, 1);
        assert_eq!(snapshot.interrupted_games, 1);
    }

    #[test]
    fn elo_estimates_follow_the_score() {
        let aggregator = StatsAggregator::new(None, true);
        record(&aggregator, &[(WhiteWin, Draw); 50]);
        let estimate = aggregator.snapshot().cells((0, 1)).estimate(true);
        assert!((estimate.score - 0.75).abs() < 1e-9);
        assert!(estimate.elo > 100.0);
        assert!(estimate.elo_error > 0.0);
        assert!(estimate.los > 0.99);

        let even = StatsAggregator::new(None, true);
        record(&even, &[(WhiteWin, WhiteWin), (BlackWin, BlackWin)]);
        let estimate = even.snapshot().cells((0, 1)).estimate(true);
        assert!((estimate.score - 0.5).abs() < 1e-9);
        assert!(estimate.elo.abs() < 1e-6);
    }

    #[test]
    fn elo_score_round_trip() {
        for elo in [-300.0, -5.0, 0.0, 1.5, 120.0] {
            assert!((score_to_elo(elo_to_score(elo)) - elo).abs() < 1e-9);
        }
    }
}
