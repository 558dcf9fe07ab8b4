//! Resource name patterns.
//!
//! A pattern is literal text with `{...}` segments, each describing a set of
//! alternatives:
//!
//! | segment   | expands to                                  |
//! |-----------|---------------------------------------------|
//! | `{3}`     | `000` .. `999`                              |
//! | `{1-12}`  | `1` .. `12`                                 |
//! | `{01-12}` | `01` .. `12` (padded to the lower bound)    |
//! | `{A-F}`   | `A` .. `F`                                  |
//! | `{x,y}`   | `x`, `y`                                    |
//!
//! `DEV{A-B}{2}` therefore covers `DEVA00` .. `DEVB99`. Candidates are
//! numbered in odometer order, rightmost segment fastest. Enumeration stops
//! at the last candidate so a run of `next` calls never wraps.

use rand::{Rng, RngCore};

use crate::error::ResourceError;

/// Widest `{N}` digit segment.
const MAX_DIGITS: u32 = 18;

const SURROGATES_START: u32 = 0xD800;
const SURROGATES_END: u32 = 0xDFFF;

/// A source of candidate resource names.
pub trait ResourcePool: Send {
    /// Reset the enumeration and return the first candidate.
    fn first(&mut self) -> String;

    /// Jump to a uniformly random candidate.
    ///
    /// A following [`next`](ResourcePool::next) continues from here.
    fn random(&mut self, rng: &mut dyn RngCore) -> String;

    /// The candidate after the previous one, or `None` past the last.
    fn next(&mut self) -> Option<String>;

    /// Size of the candidate space.
    fn combinations(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Number { start: u64, count: u64, width: usize },
    Letter { start: u32, count: u64 },
    Choice(Vec<String>),
}

impl Segment {
    fn count(&self) -> u64 {
        match self {
            Segment::Literal(_) => 1,
            Segment::Number { count, .. } | Segment::Letter { count, .. } => *count,
            Segment::Choice(options) => options.len() as u64,
        }
    }

    fn render(&self, index: u64, out: &mut String) {
        match self {
            Segment::Literal(text) => out.push_str(text),
            Segment::Number { start, width, .. } => {
                out.push_str(&format!("{:0width$}", start + index, width = *width))
            }
            Segment::Letter { start, .. } => {
                if let Some(c) = char::from_u32(start + index as u32) {
                    out.push(c);
                }
            }
            Segment::Choice(options) => out.push_str(&options[index as usize]),
        }
    }

    fn parse(pattern: &str, body: &str) -> Result<Self, ResourceError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ResourceError::invalid_pattern(pattern, "empty {} segment"));
        }
        if body.contains(',') {
            let options: Vec<String> =
                body.split(',').map(|s| s.trim().to_string()).collect();
            return Ok(Segment::Choice(options));
        }
        if let Some((low, high)) = body.split_once('-') {
            let (low, high) = (low.trim(), high.trim());
            if let (Ok(a), Ok(b)) = (low.parse::<u64>(), high.parse::<u64>()) {
                if a > b {
                    return Err(reversed(pattern, body));
                }
                let count = b
                    .checked_sub(a)
                    .and_then(|d| d.checked_add(1))
                    .ok_or_else(|| {
                        let reason = format!("range {body} is too large");
                        ResourceError::invalid_pattern(pattern, reason)
                    })?;
                let width = if low.len() > 1 && low.starts_with('0') {
                    low.len()
                } else {
                    0
                };
                return Ok(Segment::Number {
                    start: a,
                    count,
                    width,
                });
            }
            let mut lows = low.chars();
            let mut highs = high.chars();
            if let (Some(a), None, Some(b), None) =
                (lows.next(), lows.next(), highs.next(), highs.next())
            {
                if a > b {
                    return Err(reversed(pattern, body));
                }
                // char::from_u32 has no value for the surrogate block.
                if (a as u32) < SURROGATES_START && (b as u32) > SURROGATES_END {
                    return Err(ResourceError::invalid_pattern(
                        pattern,
                        format!("range {body} spans surrogate code points"),
                    ));
                }
                return Ok(Segment::Letter {
                    start: a as u32,
                    count: (b as u32 - a as u32 + 1) as u64,
                });
            }
            return Err(ResourceError::invalid_pattern(
                pattern,
                format!("cannot parse range {body}"),
            ));
        }
        match body.parse::<u32>() {
            Ok(digits) if (1..=MAX_DIGITS).contains(&digits) => Ok(Segment::Number {
                start: 0,
                count: 10u64.pow(digits),
                width: digits as usize,
            }),
            _ => Err(ResourceError::invalid_pattern(
                pattern,
                format!("cannot parse segment {{{body}}}"),
            )),
        }
    }
}

fn reversed(pattern: &str, body: &str) -> ResourceError {
    ResourceError::invalid_pattern(pattern, format!("range {body} is reversed"))
}

/// A compiled resource pattern.
#[derive(Debug, Clone)]
pub struct ResourceString {
    pattern: String,
    segments: Vec<Segment>,
    total: u64,
    position: u64,
}

impl ResourceString {
    /// Compile a pattern.
    pub fn parse(pattern: &str) -> Result<Self, ResourceError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(c) = rest.chars().next() {
            match c {
                '{' => {
                    let end = rest
                        .find('}')
                        .ok_or_else(|| ResourceError::invalid_pattern(pattern, "unclosed {"))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::parse(pattern, &rest[1..end])?);
                    rest = &rest[end + 1..];
                }
                '}' => return Err(ResourceError::invalid_pattern(pattern, "unmatched }")),
                c => {
                    literal.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let total = segments
            .iter()
            .try_fold(1u64, |acc, s| acc.checked_mul(s.count()))
            .ok_or_else(|| ResourceError::invalid_pattern(pattern, "too many combinations"))?;

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            total,
            position: 0,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The candidate at `index` in enumeration order.
    pub fn candidate(&self, index: u64) -> String {
        let mut digits = vec![0u64; self.segments.len()];
        let mut rest = index % self.total;
        for (slot, segment) in digits.iter_mut().zip(&self.segments).rev() {
            let count = segment.count();
            *slot = rest % count;
            rest /= count;
        }
        let mut out = String::new();
        for (segment, digit) in self.segments.iter().zip(digits) {
            segment.render(digit, &mut out);
        }
        out
    }
}

impl ResourcePool for ResourceString {
    fn first(&mut self) -> String {
        self.position = 0;
        self.candidate(0)
    }

    fn random(&mut self, rng: &mut dyn RngCore) -> String {
        self.position = rng.gen_range(0..self.total);
        self.candidate(self.position)
    }

    fn next(&mut self) -> Option<String> {
        if self.position + 1 >= self.total {
            self.position = self.total;
            return None;
        }
        self.position += 1;
        Some(self.candidate(self.position))
    }

    fn combinations(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn all(pattern: &str) -> Vec<String> {
        let mut pool = ResourceString::parse(pattern).unwrap();
        let mut out = vec![pool.first()];
        while let Some(name) = pool.next() {
            out.push(name);
        }
        assert_eq!(out.len() as u64, pool.combinations());
        out
    }

    #[test]
    fn test_numeric_range() {
        assert_eq!(all("R{1-3}"), vec!["R1", "R2", "R3"]);
    }

    #[test]
    fn test_digit_count() {
        let pool = ResourceString::parse("DEV{3}").unwrap();
        assert_eq!(pool.combinations(), 1000);
        assert_eq!(pool.candidate(0), "DEV000");
        assert_eq!(pool.candidate(42), "DEV042");
        assert_eq!(pool.candidate(999), "DEV999");
    }

    #[test]
    fn test_padded_range() {
        assert_eq!(all("P{08-11}"), vec!["P08", "P09", "P10", "P11"]);
    }

    #[test]
    fn test_mixed_segments_odometer_order() {
        assert_eq!(
            all("{A-B}X{0-1}{p,q}"),
            vec!["AX0p", "AX0q", "AX1p", "AX1q", "BX0p", "BX0q", "BX1p", "BX1q"]
        );
    }

    #[test]
    fn test_literal_only() {
        assert_eq!(all("SYSA"), vec!["SYSA"]);
    }

    #[test]
    fn test_next_stops_at_end() {
        let mut pool = ResourceString::parse("R{1-2}").unwrap();
        assert_eq!(pool.first(), "R1");
        assert_eq!(pool.next().as_deref(), Some("R2"));
        assert_eq!(pool.next(), None);
        assert_eq!(pool.next(), None);
        assert_eq!(pool.first(), "R1");
    }

    #[test]
    fn test_random_then_next_is_consecutive() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pool = ResourceString::parse("PORT{40000-40999}").unwrap();
        for _ in 0..20 {
            let start: u64 = pool.random(&mut rng)[4..].parse().unwrap();
            match pool.next() {
                Some(following) => assert_eq!(following[4..].parse::<u64>().unwrap(), start + 1),
                None => assert_eq!(start, 40999),
            }
        }
    }

    #[test]
    fn test_invalid_patterns() {
        for bad in ["R{1-3", "R}", "R{}", "R{3-1}", "R{Z-A}", "R{x-yy}", "R{abc}", "R{19}"] {
            let err = ResourceString::parse(bad).unwrap_err();
            assert!(
                matches!(err, ResourceError::InvalidPattern { .. }),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(ResourceString::parse("{18}{18}").is_err());
    }

    #[test]
    fn test_full_width_numeric_range_rejected() {
        let err = ResourceString::parse("R{0-18446744073709551615}").unwrap_err();
        assert!(matches!(err, ResourceError::InvalidPattern { .. }));

        let pool = ResourceString::parse("R{1-18446744073709551615}").unwrap();
        assert_eq!(pool.combinations(), u64::MAX);
    }

    #[test]
    fn test_letter_range_across_surrogates_rejected() {
        let err = ResourceString::parse("X{\u{d7ff}-\u{e000}}").unwrap_err();
        assert!(matches!(err, ResourceError::InvalidPattern { .. }));

        assert_eq!(all("X{\u{e000}-\u{e001}}"), vec!["X\u{e000}", "X\u{e001}"]);
    }
}
