//! Response validation with bounded stale-banner recovery.
//!
//! Instruments on a shared bus sometimes leave an identification banner or the tail of an
//! earlier reply in the input buffer, so a measurement query can read text that belongs to
//! somebody else. The validator classifies each reply:
//!
//! - a number is returned immediately,
//! - a banner (identification keywords, comma-separated descriptive fields) triggers a
//!   discard of buffered input, a short settle delay and a re-issue of the same query,
//!   consuming one unit of the attempt budget,
//! - anything else fails at once with [`DaqError::Parse`].
//!
//! When the budget runs out the query fails with [`DaqError::ResponseExhausted`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{DaqError, DaqResult};
use crate::session::CommandChannel;

/// Keywords that mark a reply as leftover identification text.
pub const DEFAULT_BANNER_KEYWORDS: &[&str] =
    &["keithley", "model", "inc", "lsci", "stanford", "sr830"];

/// Defines how noisy replies are recovered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Maximum number of times a query is issued.
    pub attempt_budget: u32,
    /// Wait after discarding a stale banner, before re-issuing the query.
    pub settle_delay: Duration,
    /// Wait after the initial discard, before the first attempt.
    pub pre_query_delay: Duration,
    /// Case-insensitive banner keywords.
    pub banner_keywords: Vec<String>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            attempt_budget: 3,
            settle_delay: Duration::from_millis(200),
            pre_query_delay: Duration::from_millis(300),
            banner_keywords: DEFAULT_BANNER_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

/// How a single-value reply was classified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseClass {
    /// A usable number.
    Value(f64),
    /// Leftover identification text; worth retrying.
    Banner,
    /// Anything else.
    Garbage,
}

/// How a paired reply was classified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairClass {
    /// Two usable numbers.
    Pair(f64, f64),
    /// Leftover identification text; worth retrying.
    Banner,
    /// Anything else.
    Garbage,
}

/// Parses replies and re-issues queries according to a [`RecoveryPolicy`].
#[derive(Clone, Debug)]
pub struct ResponseValidator {
    policy: RecoveryPolicy,
    banner: Option<Regex>,
}

impl ResponseValidator {
    /// Build a validator; rejects a zero attempt budget.
    pub fn new(policy: RecoveryPolicy) -> DaqResult<Self> {
        if policy.attempt_budget == 0 {
            return Err(DaqError::Configuration(
                "attempt budget must be at least 1".to_string(),
            ));
        }
        let keywords: Vec<String> = policy
            .banner_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|k| regex::escape(k.trim()))
            .collect();
        let banner = if keywords.is_empty() {
            None
        } else {
            let pattern = format!("(?i)({})", keywords.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                DaqError::Configuration(format!("invalid banner keywords: {e}"))
            })?)
        };
        Ok(Self { policy, banner })
    }

    /// The active policy.
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    fn has_banner_keyword(&self, raw: &str) -> bool {
        self.banner.as_ref().is_some_and(|re| re.is_match(raw))
    }

    /// Classify a single-value reply.
    pub fn classify(&self, raw: &str) -> ResponseClass {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<f64>() {
            return ResponseClass::Value(value);
        }
        if self.has_banner_keyword(raw) || raw.contains(',') {
            ResponseClass::Banner
        } else {
            ResponseClass::Garbage
        }
    }

    /// Classify a paired `a,b` reply.
    pub fn classify_pair(&self, raw: &str) -> PairClass {
        let raw = raw.trim();
        if self.has_banner_keyword(raw) {
            return PairClass::Banner;
        }
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        match fields.as_slice() {
            [a, b] => match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(a), Ok(b)) => PairClass::Pair(a, b),
                _ => PairClass::Garbage,
            },
            fields if fields.len() > 2 => PairClass::Banner,
            _ => PairClass::Garbage,
        }
    }

    /// Parse a reply with no recovery: a banner is as fatal as garbage.
    pub fn parse_numeric(&self, command: &str, raw: &str) -> DaqResult<f64> {
        match self.classify(raw) {
            ResponseClass::Value(value) => Ok(value),
            ResponseClass::Banner | ResponseClass::Garbage => Err(DaqError::Parse {
                command: command.to_string(),
                response: raw.to_string(),
            }),
        }
    }

    /// Issue `command` and return its numeric reply, recovering from stale banners.
    pub async fn query_numeric<C>(&self, channel: &mut C, command: &str) -> DaqResult<f64>
    where
        C: CommandChannel + ?Sized,
    {
        self.prepare(channel).await?;
        let mut last = String::new();
        for attempt in 1..=self.policy.attempt_budget {
            let raw = channel.query(command).await?;
            match self.classify(&raw) {
                ResponseClass::Value(value) => {
                    if attempt > 1 {
                        debug!(command, attempt, "recovered after stale banner");
                    }
                    return Ok(value);
                }
                ResponseClass::Banner => {
                    if attempt < self.policy.attempt_budget {
                        self.recover(channel, command, attempt, &raw).await?;
                    }
                    last = raw;
                }
                ResponseClass::Garbage => {
                    return Err(DaqError::Parse {
                        command: command.to_string(),
                        response: raw,
                    })
                }
            }
        }
        Err(self.exhausted(command, last))
    }

    /// Issue `command` and return its paired `a,b` reply, recovering from stale banners.
    pub async fn query_pair<C>(&self, channel: &mut C, command: &str) -> DaqResult<(f64, f64)>
    where
        C: CommandChannel + ?Sized,
    {
        self.prepare(channel).await?;
        let mut last = String::new();
        for attempt in 1..=self.policy.attempt_budget {
            let raw = channel.query(command).await?;
            match self.classify_pair(&raw) {
                PairClass::Pair(a, b) => return Ok((a, b)),
                PairClass::Banner => {
                    if attempt < self.policy.attempt_budget {
                        self.recover(channel, command, attempt, &raw).await?;
                    }
                    last = raw;
                }
                PairClass::Garbage => {
                    return Err(DaqError::Parse {
                        command: command.to_string(),
                        response: raw,
                    })
                }
            }
        }
        Err(self.exhausted(command, last))
    }

    async fn prepare<C>(&self, channel: &mut C) -> DaqResult<()>
    where
        C: CommandChannel + ?Sized,
    {
        channel.discard_input().await?;
        if !self.policy.pre_query_delay.is_zero() {
            sleep(self.policy.pre_query_delay).await;
        }
        Ok(())
    }

    async fn recover<C>(&self, channel: &mut C, command: &str, attempt: u32, raw: &str) -> DaqResult<()>
    where
        C: CommandChannel + ?Sized,
    {
        warn!(
            command,
            attempt,
            budget = self.policy.attempt_budget,
            response = raw,
            "stale banner in reply, discarding input and retrying"
        );
        channel.discard_input().await?;
        if !self.policy.settle_delay.is_zero() {
            sleep(self.policy.settle_delay).await;
        }
        Ok(())
    }

    fn exhausted(&self, command: &str, last: String) -> DaqError {
        DaqError::ResponseExhausted {
            command: command.to_string(),
            attempts: self.policy.attempt_budget,
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::dialect::InstrumentKind;
    use crate::session::{InstrumentHandle, InstrumentSession};

    const BANNER: &str = "Keithley Instruments Inc., Model 2636B, 4407040, 4.0.4";

    fn validator() -> ResponseValidator {
        ResponseValidator::new(RecoveryPolicy::default()).unwrap()
    }

    fn session(adapter: &MockAdapter) -> InstrumentSession {
        InstrumentSession::new(
            InstrumentHandle::new("mock", InstrumentKind::Keithley2636B),
            Box::new(adapter.clone()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_classify() {
        let v = validator();
        assert_eq!(v.classify(" 1.23e-3 "), ResponseClass::Value(1.23e-3));
        assert_eq!(v.classify(BANNER), ResponseClass::Banner);
        assert_eq!(v.classify("LSCI,MODEL335,1234/1234,1.0"), ResponseClass::Banner);
        assert_eq!(v.classify("-1.0,+2.0"), ResponseClass::Banner);
        assert_eq!(v.classify("garbage#@!"), ResponseClass::Garbage);
        assert_eq!(v.classify(""), ResponseClass::Garbage);
    }

    #[test]
    fn test_classify_pair() {
        let v = validator();
        assert_eq!(v.classify_pair("1.5e-6,-2.0e-7"), PairClass::Pair(1.5e-6, -2.0e-7));
        assert_eq!(
            v.classify_pair("Stanford_Research_Systems,SR830,s/n12345,ver1.07"),
            PairClass::Banner
        );
        assert_eq!(v.classify_pair("1.0,2.0,3.0"), PairClass::Banner);
        assert_eq!(v.classify_pair("1.0"), PairClass::Garbage);
        assert_eq!(v.classify_pair("x,y"), PairClass::Garbage);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let policy = RecoveryPolicy {
            attempt_budget: 0,
            ..RecoveryPolicy::default()
        };
        assert!(matches!(
            ResponseValidator::new(policy),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_custom_keywords() {
        let policy = RecoveryPolicy {
            banner_keywords: vec!["agilent".into()],
            ..RecoveryPolicy::default()
        };
        let v = ResponseValidator::new(policy).unwrap();
        assert_eq!(v.classify("AGILENT 34401A"), ResponseClass::Banner);
        assert_eq!(v.classify("KEITHLEY 2450"), ResponseClass::Garbage);
    }

    #[test]
    fn test_parse_numeric_never_retries() {
        let v = validator();
        assert_eq!(v.parse_numeric("KRDG? A", "295.15").unwrap(), 295.15);
        assert!(matches!(
            v.parse_numeric("KRDG? A", BANNER),
            Err(DaqError::Parse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_on_first_attempt_issues_one_query() {
        let adapter = MockAdapter::new().on("MEAS:CURR?", "0.5");
        let mut session = session(&adapter);
        let value = validator()
            .query_numeric(&mut session, "MEAS:CURR?")
            .await
            .unwrap();
        assert_eq!(value, 0.5);
        assert_eq!(adapter.call_log().len(), 1);
        assert_eq!(adapter.discard_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_recovery_succeeds_on_third_attempt() {
        let adapter = MockAdapter::new().on_sequence("MEAS:CURR?", [BANNER, BANNER, "0.00123"]);
        let mut session = session(&adapter);
        let value = validator()
            .query_numeric(&mut session, "MEAS:CURR?")
            .await
            .unwrap();
        assert_eq!(value, 0.00123);
        assert_eq!(adapter.call_log().len(), 3);
        // one initial discard plus one per banner
        assert_eq!(adapter.discard_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_fails_without_retry() {
        let adapter = MockAdapter::new().on("MEAS:CURR?", "garbage#@!");
        let mut session = session(&adapter);
        let err = validator()
            .query_numeric(&mut session, "MEAS:CURR?")
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Parse { .. }));
        assert_eq!(adapter.call_log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let adapter = MockAdapter::new().on("MEAS:CURR?", BANNER);
        let mut session = session(&adapter);
        let started = tokio::time::Instant::now();
        let err = validator()
            .query_numeric(&mut session, "MEAS:CURR?")
            .await
            .unwrap_err();
        match err {
            DaqError::ResponseExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, BANNER);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(adapter.call_log().len(), 3);
        // no discard or settle after the final banner
        assert_eq!(adapter.discard_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300 + 2 * 200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_budget_exhausted_without_trailing_recovery() {
        let adapter = MockAdapter::new().on("OUTP? 1,2", "1.0,2.0,3.0");
        let mut session = session(&adapter);
        let err = validator()
            .query_pair(&mut session, "OUTP? 1,2")
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ResponseExhausted { attempts: 3, .. }));
        assert_eq!(adapter.call_log().len(), 3);
        assert_eq!(adapter.discard_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_input_is_discarded_before_first_attempt() {
        let adapter = MockAdapter::new().on("print(smua.measure.i())", "1.0e-6");
        adapter.push_stale(BANNER);
        let mut session = session(&adapter);
        let value = validator()
            .query_numeric(&mut session, "print(smua.measure.i())")
            .await
            .unwrap();
        assert_eq!(value, 1.0e-6);
        assert_eq!(adapter.call_log().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_recovery() {
        let adapter = MockAdapter::new().on_sequence(
            "OUTP? 1,2",
            ["Stanford_Research_Systems,SR830,s/n12345,ver1.07", "1.0e-6,2.0e-7"],
        );
        let mut session = session(&adapter);
        let (x, y) = validator()
            .query_pair(&mut session, "OUTP? 1,2")
            .await
            .unwrap();
        assert_eq!((x, y), (1.0e-6, 2.0e-7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let adapter = MockAdapter::new();
        let mut session = session(&adapter);
        let err = validator()
            .query_numeric(&mut session, "MEAS:CURR?")
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert_eq!(adapter.call_log().len(), 1);
    }
}
