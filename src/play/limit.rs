use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

use crate::common::{parse_fp_from_str, parse_int_from_str, Res};

/// Safety ceiling for engines limited only by nodes or depth: there is no
/// clock to derive a deadline from, but a hung engine still has to be caught.
pub const HUNG_ENGINE_CEILING: Duration = Duration::from_secs(10);

/// A classical `moves/time+inc` time control. `moves == 0` means sudden death.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct ClassicalTc {
    pub moves: u32,
    pub time: Duration,
    pub increment: Duration,
}

impl Display for ClassicalTc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.moves > 0 {
            write!(f, "{}/", self.moves)?;
        }
        write!(f, "{}", format_seconds(self.time))?;
        if !self.increment.is_zero() {
            write!(f, "+{}", format_seconds(self.increment))?;
        }
        Ok(())
    }
}

fn format_seconds(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if (secs - secs.round()).abs() < 1e-9 {
        format!("{}", secs.round() as u64)
    } else {
        format!("{secs}")
    }
}

impl FromStr for ClassicalTc {
    type Err = anyhow::Error;

    /// Accepts `moves/time+inc`, `time+inc` and plain `time`, where `time`
    /// may be given as seconds (`9.64`) or minutes:seconds (`1:9.65`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (moves, rest) = match s.split_once('/') {
            Some((moves, rest)) => (parse_int_from_str::<u32>(moves, "the tc move count")?, rest),
            None => (0, s),
        };
        let (time, increment) = match rest.split_once('+') {
            Some((time, inc)) => (
                parse_clock_time(time)?,
                Duration::from_secs_f64(parse_fp_from_str::<f64>(inc, "the tc increment")?.max(0.0)),
            ),
            None => (parse_clock_time(rest)?, Duration::ZERO),
        };
        Ok(ClassicalTc { moves, time, increment })
    }
}

fn parse_clock_time(s: &str) -> Res<Duration> {
    let secs = match s.split_once(':') {
        Some((minutes, seconds)) => {
            let minutes = parse_fp_from_str::<f64>(minutes, "the tc minutes")?;
            let seconds = parse_fp_from_str::<f64>(seconds, "the tc seconds")?;
            minutes * 60.0 + seconds
        }
        None => parse_fp_from_str::<f64>(s, "the tc time")?,
    };
    if secs < 0.0 || !secs.is_finite() {
        bail!("the tc time must be non-negative")
    }
    Ok(Duration::from_secs_f64(secs))
}

/// The combined search budget of one engine: classical clock, fixed time per
/// move, nodes, depth, or additive combinations thereof. `timemargin` is the
/// slack a response may take beyond the clock before it counts as a loss.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[must_use]
pub struct Limit {
    pub tc: Option<ClassicalTc>,
    pub fixed_time: Option<Duration>,
    pub nodes: Option<u64>,
    pub depth: Option<u32>,
    pub timemargin: Duration,
}

impl Limit {
    /// Rejects contradictory or empty limits; engines need something to obey.
    pub fn validate(&self) -> Res<()> {
        if self.tc.is_some() && self.fixed_time.is_some() {
            bail!("cannot use tc and st together!")
        }
        if let Some(tc) = &self.tc {
            if tc.time.is_zero() {
                bail!("no time control specified!")
            }
        }
        if self.tc.is_none() && self.fixed_time.is_none() && self.nodes.is_none() && self.depth.is_none() {
            bail!("no time control specified!")
        }
        Ok(())
    }

    /// How long a single response may take before the engine is considered
    /// lost on time (or hung, for node/depth limits without a clock).
    pub fn move_deadline(&self, remaining: Option<Duration>) -> Duration {
        let base = if let Some(fixed) = self.fixed_time {
            fixed
        } else if self.tc.is_some() {
            remaining.unwrap_or(Duration::ZERO)
        } else {
            HUNG_ENGINE_CEILING
        };
        base.saturating_add(self.timemargin)
    }

    /// True if the measured think time broke this limit's clockless budget.
    /// Classical clocks are checked by [`Clock::consume`] instead.
    pub fn exceeded_fixed(&self, elapsed: Duration) -> bool {
        match self.fixed_time {
            Some(fixed) => elapsed > fixed.saturating_add(self.timemargin),
            None => false,
        }
    }

    pub fn clock(&self) -> Option<Clock> {
        self.tc.as_ref().map(Clock::new)
    }
}

impl Display for Limit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec![];
        if let Some(tc) = &self.tc {
            parts.push(format!("{tc}"));
        }
        if let Some(fixed) = self.fixed_time {
            parts.push(format!("{} ms/move", fixed.as_millis()));
        }
        if let Some(nodes) = self.nodes {
            parts.push(format!("{nodes} nodes"));
        }
        if let Some(depth) = self.depth {
            parts.push(format!("depth {depth}"));
        }
        if parts.is_empty() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// The live clock of one side in one game. Only engines with a classical tc
/// carry one; fixed-time and node/depth limits don't accumulate.
#[derive(Debug, Copy, Clone)]
#[must_use]
pub struct Clock {
    pub remaining: Duration,
    pub increment: Duration,
    /// Full moves until the next `moves/...` refill, when the tc has cycles.
    moves_left: Option<u32>,
    cycle: u32,
    refill: Duration,
}

impl Clock {
    pub fn new(tc: &ClassicalTc) -> Self {
        Clock {
            remaining: tc.time,
            increment: tc.increment,
            moves_left: (tc.moves > 0).then_some(tc.moves),
            cycle: tc.moves,
            refill: tc.time,
        }
    }

    /// Moves to go until the next refill, as sent in the go command.
    pub fn moves_to_go(&self) -> Option<u32> {
        self.moves_left
    }

    /// Books one move taking `elapsed`. Returns false when the move overdrew
    /// the clock by more than `margin`, which forfeits the game; the clock is
    /// left untouched in that case. Otherwise the elapsed time is subtracted,
    /// the increment added, and the cycle refill applied when it comes due.
    pub fn consume(&mut self, elapsed: Duration, margin: Duration) -> bool {
        if elapsed > self.remaining.saturating_add(margin) {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(elapsed) + self.increment;
        if let Some(moves_left) = &mut self.moves_left {
            *moves_left -= 1;
            if *moves_left == 0 {
                *moves_left = self.cycle;
                self.remaining += self.refill;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tc(s: &str) -> ClassicalTc {
        s.parse().unwrap()
    }

    #[test]
    fn parse_tc_forms() {
        assert_eq!(
            tc("40/60+0.5"),
            ClassicalTc { moves: 40, time: Duration::from_secs(60), increment: Duration::from_millis(500) }
        );
        assert_eq!(
            tc("10/9.64"),
            ClassicalTc { moves: 10, time: Duration::from_millis(9640), increment: Duration::ZERO }
        );
        // minutes:seconds in the time part
        assert_eq!(
            tc("40/1:9.65+0.1"),
            ClassicalTc { moves: 40, time: Duration::from_millis(69650), increment: Duration::from_millis(100) }
        );
        assert_eq!(
            tc("2+1"),
            ClassicalTc { moves: 0, time: Duration::from_secs(2), increment: Duration::from_secs(1) }
        );
        assert!("x/1".parse::<ClassicalTc>().is_err());
        assert!("1+x".parse::<ClassicalTc>().is_err());
    }

    #[test]
    fn tc_and_st_are_mutually_exclusive() {
        let limit = Limit {
            tc: Some(tc("10/1+0")),
            fixed_time: Some(Duration::from_secs(5)),
            ..Limit::default()
        };
        assert!(limit.validate().is_err());
    }

    #[test]
    fn zero_tc_counts_as_unspecified() {
        let limit = Limit { tc: Some(tc("10/0+0")), ..Limit::default() };
        assert!(limit.validate().is_err());
        assert!(Limit::default().validate().is_err());
        let nodes_only = Limit { nodes: Some(5000), ..Limit::default() };
        assert!(nodes_only.validate().is_ok());
    }

    #[test]
    fn deadlines() {
        let margin = Duration::from_millis(50);
        let classical = Limit { tc: Some(tc("1+0")), timemargin: margin, ..Limit::default() };
        assert_eq!(
            classical.move_deadline(Some(Duration::from_millis(300))),
            Duration::from_millis(350)
        );
        let fixed = Limit { fixed_time: Some(Duration::from_millis(100)), timemargin: margin, ..Limit::default() };
        assert_eq!(fixed.move_deadline(None), Duration::from_millis(150));
        assert!(fixed.exceeded_fixed(Duration::from_millis(151)));
        assert!(!fixed.exceeded_fixed(Duration::from_millis(150)));
        let nodes = Limit { nodes: Some(1), ..Limit::default() };
        assert_eq!(nodes.move_deadline(None), HUNG_ENGINE_CEILING);
    }

    #[test]
    fn clock_bookkeeping() {
        let mut clock = Clock::new(&tc("2/10+1"));
        assert_eq!(clock.moves_to_go(), Some(2));
        assert!(clock.consume(Duration::from_secs(4), Duration::ZERO));
        // 10 - 4 + 1
        assert_eq!(clock.remaining, Duration::from_secs(7));
        assert_eq!(clock.moves_to_go(), Some(1));
        // second move completes the cycle: 7 - 1 + 1 + 10 refill
        assert!(clock.consume(Duration::from_secs(1), Duration::ZERO));
        assert_eq!(clock.remaining, Duration::from_secs(17));
        assert_eq!(clock.moves_to_go(), Some(2));
    }

    #[test]
    fn overdraft_beyond_margin_forfeits() {
        let mut clock = Clock::new(&tc("0.1+0"));
        let margin = Duration::from_millis(50);
        assert!(!clock.consume(Duration::from_millis(500), margin));
        // within the margin the move stands and the clock saturates at zero
        let mut clock = Clock::new(&tc("0.1+0"));
        assert!(clock.consume(Duration::from_millis(140), margin));
        assert_eq!(clock.remaining, Duration::ZERO);
    }
}
