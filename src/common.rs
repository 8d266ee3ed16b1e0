use std::fmt::Display;
use std::iter::Peekable;
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

use colored::Colorize;
use num::{Float, PrimInt};

pub use anyhow;

pub type Res<T> = anyhow::Result<T>;

/// A peekable whitespace tokenizer over one line of input.
/// Both the CLI parser and the engine wire parser work on these.
pub type Tokens<'a> = Peekable<SplitWhitespace<'a>>;

pub fn tokens(line: &str) -> Tokens {
    line.split_whitespace().peekable()
}

pub fn parse_int_from_str<T: PrimInt + FromStr>(as_str: &str, name: &str) -> Res<T> {
    // for some weird Rust reason, parse::<T>() returns a completely unbounded Err on failure,
    // so we just write the error message ourselves
    as_str
        .parse::<T>()
        .map_err(|_err| anyhow::anyhow!("Couldn't parse {name} ('{}')", as_str.red()))
}

pub fn parse_int<T: PrimInt + FromStr + Display>(words: &mut Tokens, name: &str) -> Res<T> {
    parse_int_from_str(
        words
            .next()
            .ok_or_else(|| anyhow::anyhow!("Missing {name}"))?,
        name,
    )
}

pub fn parse_fp_from_str<T: Float + FromStr>(as_str: &str, name: &str) -> Res<T> {
    as_str
        .parse::<T>()
        .map_err(|_err| anyhow::anyhow!("Couldn't parse {name} ('{}')", as_str.red()))
}

pub fn parse_bool_from_str(input: &str, name: &str) -> Res<bool> {
    // engine options and cutechess-style flags use on/off, most other tools use true/false,
    // so accept both spellings everywhere
    if input.eq_ignore_ascii_case("true") || input.eq_ignore_ascii_case("on") {
        Ok(true)
    } else if input.eq_ignore_ascii_case("false") || input.eq_ignore_ascii_case("off") {
        Ok(false)
    } else {
        Err(anyhow::anyhow!(
            "Incorrect value for '{0}': Expected either '{1}' or '{2}', not '{3}'",
            name.bold(),
            "on".bold(),
            "off".bold(),
            input.red(),
        ))
    }
}

/// Parses a whole number of milliseconds, as exchanged in `go wtime ...` commands.
/// Engines are allowed to report negative remaining time; that clamps to zero.
pub fn parse_duration_ms(words: &mut Tokens, name: &str) -> Res<Duration> {
    let num_ms: i64 = parse_int(words, name)?;
    Ok(Duration::from_millis(num_ms.max(0) as u64))
}

/// Parses a duration given in seconds with an optional fractional part, like the
/// `tc=40/60+0.5` and `st=1.5` option values.
pub fn parse_duration_secs(as_str: &str, name: &str) -> Res<Duration> {
    let secs = parse_fp_from_str::<f64>(as_str, name)?;
    if secs < 0.0 || !secs.is_finite() {
        anyhow::bail!("{name} must be a non-negative number of seconds, not '{}'", as_str.red())
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_test() {
        assert_eq!(parse_int_from_str::<usize>("42", "test").unwrap(), 42);
        assert!(parse_int_from_str::<usize>("-1", "test").is_err());
        assert!(parse_int_from_str::<i64>("-1", "test").is_ok());
        assert!(parse_int_from_str::<usize>("4x", "test").is_err());
    }

    #[test]
    fn parse_bool_test() {
        assert!(parse_bool_from_str("on", "x").unwrap());
        assert!(parse_bool_from_str("True", "x").unwrap());
        assert!(!parse_bool_from_str("off", "x").unwrap());
        assert!(!parse_bool_from_str("false", "x").unwrap());
        assert!(parse_bool_from_str("yes", "x").is_err());
    }

    #[test]
    fn parse_duration_test() {
        assert_eq!(parse_duration_secs("9.64", "tc").unwrap(), Duration::from_millis(9640));
        assert_eq!(parse_duration_secs("0", "tc").unwrap(), Duration::ZERO);
        assert!(parse_duration_secs("-1", "tc").is_err());
        assert_eq!(
            parse_duration_ms(&mut tokens("-50"), "wtime").unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            parse_duration_ms(&mut tokens("1234"), "wtime").unwrap(),
            Duration::from_millis(1234)
        );
    }
}
