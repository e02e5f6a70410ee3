//! Deterministic failure injection for named calls.
//!
//! An [`RpcChaos`] registry is owned by a [`ClientCallManager`](crate::ClientCallManager)
//! and consulted once per invocation. Tests build their own registry so they
//! can run in parallel without sharing state.
//!
//! ```ignore
//! let chaos = Arc::new(RpcChaos::new());
//! chaos.set_failure("Echo", RpcFailure::FailBeforeSend);
//!
//! let manager = ClientCallManager::new(Handle::current(), CallManagerConfig::new().with_chaos(chaos));
//! ```

use crate::error::{GrpcError, GrpcResult};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

/// How an invocation should fail, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcFailure {
  #[default]
  None,
  /// The request never leaves the process
  FailBeforeSend,
  /// The request is sent and answered, but the caller sees a failure
  FailAfterReceive,
}

impl FromStr for RpcFailure {
  type Err = GrpcError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "none" => Ok(RpcFailure::None),
      "fail_before_send" | "request" => Ok(RpcFailure::FailBeforeSend),
      "fail_after_receive" | "response" => Ok(RpcFailure::FailAfterReceive),
      other => Err(GrpcError::InvalidConfig(format!(
        "unknown rpc failure mode '{other}'"
      ))),
    }
  }
}

impl fmt::Display for RpcFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      RpcFailure::None => "none",
      RpcFailure::FailBeforeSend => "fail_before_send",
      RpcFailure::FailAfterReceive => "fail_after_receive",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy)]
struct FailureRule {
  mode: RpcFailure,
  /// `None` injects forever
  remaining: Option<u64>,
}

/// Registry mapping call names to injected failure modes.
///
/// Reads take a shared lock; a lookup for an unregistered name returns
/// [`RpcFailure::None`] without writing.
#[derive(Debug, Default)]
pub struct RpcChaos {
  rules: RwLock<HashMap<String, FailureRule>>,
}

impl RpcChaos {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parse rules of the form `Name=mode[:count]`, comma separated.
  ///
  /// `mode` is one of `none`, `fail_before_send` (alias `request`) or
  /// `fail_after_receive` (alias `response`). With `:count` the rule only
  /// applies to the next `count` calls.
  pub fn from_spec(spec: &str) -> GrpcResult<Self> {
    let chaos = Self::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
      let (name, rule) = entry.split_once('=').ok_or_else(|| {
        GrpcError::InvalidConfig(format!("rpc failure rule '{entry}' is missing '='"))
      })?;
      let name = name.trim();
      if name.is_empty() {
        return Err(GrpcError::InvalidConfig(format!(
          "rpc failure rule '{entry}' has an empty call name"
        )));
      }

      match rule.split_once(':') {
        Some((mode, count)) => {
          let count = count.trim().parse::<u64>().map_err(|e| {
            GrpcError::InvalidConfig(format!(
              "rpc failure rule '{entry}' has an invalid count: {e}"
            ))
          })?;
          chaos.set_failure_times(name, mode.parse()?, count);
        }
        None => chaos.set_failure(name, rule.parse()?),
      }
    }

    Ok(chaos)
  }

  /// Inject `mode` for every future call named `call_name`
  pub fn set_failure(&self, call_name: impl Into<String>, mode: RpcFailure) {
    self.insert(call_name.into(), FailureRule { mode, remaining: None });
  }

  /// Inject `mode` for the next `times` calls named `call_name` only.
  ///
  /// `times == 0` removes any rule for the name.
  pub fn set_failure_times(&self, call_name: impl Into<String>, mode: RpcFailure, times: u64) {
    let call_name = call_name.into();
    if times == 0 {
      self.clear_failure(&call_name);
      return;
    }
    self.insert(
      call_name,
      FailureRule {
        mode,
        remaining: Some(times),
      },
    );
  }

  pub fn clear_failure(&self, call_name: &str) {
    self.rules
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(call_name);
  }

  pub fn clear(&self) {
    self.rules
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }

  /// Current rule for `call_name`, without consuming a bounded rule
  pub fn get_failure(&self, call_name: &str) -> RpcFailure {
    self.rules
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(call_name)
      .map(|rule| rule.mode)
      .unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.rules
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_empty()
  }

  /// Lookup on the call path. Bounded rules lose one use per hit and are
  /// removed once exhausted.
  pub(crate) fn take_failure(&self, call_name: &str) -> RpcFailure {
    {
      let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
      match rules.get(call_name) {
        None => return RpcFailure::None,
        Some(rule) if rule.remaining.is_none() => return rule.mode,
        Some(_) => {}
      }
    }

    let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
    let Some(rule) = rules.get_mut(call_name) else {
      return RpcFailure::None;
    };
    match rule.remaining {
      None => rule.mode,
      Some(0) => {
        rules.remove(call_name);
        RpcFailure::None
      }
      Some(n) => {
        let mode = rule.mode;
        if n == 1 {
          rules.remove(call_name);
        } else {
          rule.remaining = Some(n - 1);
        }
        mode
      }
    }
  }

  fn insert(&self, call_name: String, rule: FailureRule) {
    self.rules
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(call_name, rule);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unregistered_name_is_none() {
    let chaos = RpcChaos::new();
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::None);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::None);
    assert!(chaos.is_empty());
  }

  #[test]
  fn test_set_get_clear() {
    let chaos = RpcChaos::new();
    chaos.set_failure("Echo", RpcFailure::FailBeforeSend);
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::FailBeforeSend);
    assert_eq!(chaos.get_failure("Other"), RpcFailure::None);

    chaos.set_failure("Echo", RpcFailure::FailAfterReceive);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::FailAfterReceive);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::FailAfterReceive);

    chaos.clear_failure("Echo");
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::None);
  }

  #[test]
  fn test_bounded_rule_expires() {
    let chaos = RpcChaos::new();
    chaos.set_failure_times("Echo", RpcFailure::FailBeforeSend, 2);

    assert_eq!(chaos.take_failure("Echo"), RpcFailure::FailBeforeSend);
    // peeking does not consume
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::FailBeforeSend);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::FailBeforeSend);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::None);
    assert!(chaos.is_empty());
  }

  #[test]
  fn test_zero_count_never_fires() {
    let chaos = RpcChaos::new();
    chaos.set_failure_times("Echo", RpcFailure::FailBeforeSend, 0);
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::None);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::None);
    assert!(chaos.is_empty());
  }

  #[test]
  fn test_zero_count_clears_existing_rule() {
    let chaos = RpcChaos::new();
    chaos.set_failure("Echo", RpcFailure::FailAfterReceive);
    chaos.set_failure_times("Echo", RpcFailure::FailBeforeSend, 0);
    assert_eq!(chaos.get_failure("Echo"), RpcFailure::None);
    assert_eq!(chaos.take_failure("Echo"), RpcFailure::None);
  }

  #[test]
  fn test_from_spec() {
    let chaos = RpcChaos::from_spec(
      "Echo=fail_before_send, Slow=response:1,Ping=request ,Noop=none",
    )
    .unwrap();

    assert_eq!(chaos.get_failure("Echo"), RpcFailure::FailBeforeSend);
    assert_eq!(chaos.get_failure("Ping"), RpcFailure::FailBeforeSend);
    assert_eq!(chaos.get_failure("Noop"), RpcFailure::None);
    assert_eq!(chaos.take_failure("Slow"), RpcFailure::FailAfterReceive);
    assert_eq!(chaos.take_failure("Slow"), RpcFailure::None);
  }

  #[test]
  fn test_from_spec_empty() {
    assert!(RpcChaos::from_spec("").unwrap().is_empty());
    assert!(RpcChaos::from_spec(" , ").unwrap().is_empty());
  }

  #[test]
  fn test_from_spec_rejects_garbage() {
    assert!(RpcChaos::from_spec("Echo").is_err());
    assert!(RpcChaos::from_spec("=request").is_err());
    assert!(RpcChaos::from_spec("Echo=explode").is_err());
    assert!(RpcChaos::from_spec("Echo=request:many").is_err());
  }

  #[test]
  fn test_concurrent_readers() {
    let chaos = std::sync::Arc::new(RpcChaos::new());
    chaos.set_failure("Echo", RpcFailure::FailAfterReceive);

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let chaos = chaos.clone();
        std::thread::spawn(move || {
          (0..1000).all(|_| chaos.take_failure("Echo") == RpcFailure::FailAfterReceive)
        })
      })
      .collect();

    for handle in handles {
      assert!(handle.join().unwrap());
    }
  }

  #[test]
  fn test_display_round_trips_through_parse() {
    for mode in [
      RpcFailure::None,
      RpcFailure::FailBeforeSend,
      RpcFailure::FailAfterReceive,
    ] {
      assert_eq!(mode.to_string().parse::<RpcFailure>().unwrap(), mode);
    }
  }
}
