// =============================================================================
// Per-Symbol Validation — graceful degradation before resources commit
// =============================================================================
//
// Five checks run for every symbol before provisioning executes. The policy
// lives with the coordinator: any symbol failing any check is dropped with a
// warning and the session proceeds with the survivors; if every symbol
// fails, the session refuses to start.
// =============================================================================

use chrono::NaiveDate;

use crate::calendar::TimeManager;
use crate::datasource::DataSource;
use crate::provisioning::ProvisioningRequirements;
use crate::types::Interval;

/// Outcome of a single named check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            detail: String::new(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// All five check outcomes for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolValidationResult {
    pub symbol: String,
    pub checks: Vec<CheckResult>,
}

impl SymbolValidationResult {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Human-readable reasons for every failed check.
    pub fn failures(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect()
    }
}

/// Run the five checks for one symbol against its provisioning requirements.
pub fn validate_symbol(
    req: &ProvisioningRequirements,
    source: &dyn DataSource,
    time_manager: &TimeManager,
    exchange: &str,
    session_base: Interval,
    session_date: NaiveDate,
) -> SymbolValidationResult {
    let symbol = req.symbol.as_str();
    let mut checks = Vec::with_capacity(5);

    // 1. Is a data source reachable for this symbol?
    let reachable = source.supports_symbol(symbol);
    checks.push(if reachable {
        CheckResult::pass("data_source")
    } else {
        CheckResult::fail(
            "data_source",
            format!("source '{}' has no data for {symbol}", source.name()),
        )
    });

    // 2. Does the source support the required intervals (streamable directly
    //    or derivable from a streamable base)?
    let streamable = source.supported_intervals(symbol);
    let base_streamable = streamable.contains(&req.base_interval);
    let mut unsupported: Vec<String> = Vec::new();
    for iv in &req.required_intervals {
        let direct = streamable.contains(iv);
        let derivable = base_streamable && iv.is_derivable_from(req.base_interval);
        if !direct && !derivable {
            unsupported.push(iv.to_string());
        }
    }
    checks.push(if unsupported.is_empty() {
        CheckResult::pass("intervals")
    } else {
        CheckResult::fail(
            "intervals",
            format!("unsupported intervals: {}", unsupported.join(", ")),
        )
    });

    // 3. Does historical data exist for the required warmup window?
    let mut missing_history: Vec<String> = Vec::new();
    for (interval, trading_days) in &req.historical_windows {
        let start = time_manager.previous_trading_date(session_date, *trading_days, exchange);
        if !source.has_historical(symbol, *interval, start, session_date) {
            missing_history.push(format!("{interval} back to {start}"));
        }
    }
    checks.push(if missing_history.is_empty() {
        CheckResult::pass("historical")
    } else {
        CheckResult::fail(
            "historical",
            format!("missing history: {}", missing_history.join("; ")),
        )
    });

    // 4. Is the resolved base interval consistent with the session-wide base?
    checks.push(if req.base_interval == session_base {
        CheckResult::pass("base_interval")
    } else {
        CheckResult::fail(
            "base_interval",
            format!(
                "resolved base {} conflicts with session base {}",
                req.base_interval, session_base
            ),
        )
    });

    // 5. Do the intervals the symbol will use meet the per-symbol config
    //    requirements? Every required interval must divide cleanly into the
    //    base grid (an interval that slipped in without that property would
    //    silently never aggregate).
    let mut misaligned: Vec<String> = Vec::new();
    for iv in &req.required_intervals {
        if !iv.is_derivable_from(req.base_interval) {
            misaligned.push(iv.to_string());
        }
    }
    checks.push(if misaligned.is_empty() {
        CheckResult::pass("config_requirements")
    } else {
        CheckResult::fail(
            "config_requirements",
            format!("intervals not on the base grid: {}", misaligned.join(", ")),
        )
    });

    SymbolValidationResult {
        symbol: symbol.to_string(),
        checks,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::UsEquityCalendar;
    use crate::datasource::SyntheticSource;
    use crate::provisioning::OpKind;
    use crate::types::{AddedBy, Mode};
    use std::sync::Arc;

    fn iv(tag: &str) -> Interval {
        Interval::parse(tag).unwrap()
    }

    fn req(symbol: &str, historical_days: u32) -> ProvisioningRequirements {
        ProvisioningRequirements {
            op: OpKind::Symbol,
            source: AddedBy::Config,
            symbol: symbol.to_string(),
            base_interval: iv("1m"),
            required_intervals: vec![iv("1m"), iv("5m")],
            historical_windows: if historical_days > 0 {
                vec![(iv("1m"), historical_days)]
            } else {
                Vec::new()
            },
            indicators: Vec::new(),
            need_session_load: true,
            symbol_exists: false,
            symbol_is_adhoc: false,
            existing_intervals: Vec::new(),
            existing_indicators: Vec::new(),
        }
    }

    fn fixture() -> (SyntheticSource, TimeManager) {
        let source =
            SyntheticSource::new(Arc::new(UsEquityCalendar::new())).with_symbols(["AAPL"]);
        let tm = TimeManager::new(Mode::Backtest, "US_EQUITY");
        (source, tm)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()
    }

    #[test]
    fn known_symbol_passes_all_five() {
        let (source, tm) = fixture();
        let result = validate_symbol(&req("AAPL", 3), &source, &tm, "US_EQUITY", iv("1m"), date());
        assert!(result.passed(), "failures: {:?}", result.failures());
        assert_eq!(result.checks.len(), 5);
    }

    #[test]
    fn unknown_symbol_fails_reachability() {
        let (source, tm) = fixture();
        let result =
            validate_symbol(&req("BADTKR", 0), &source, &tm, "US_EQUITY", iv("1m"), date());
        assert!(!result.passed());
        let failed: Vec<_> = result.checks.iter().filter(|c| !c.passed).collect();
        assert!(failed.iter().any(|c| c.name == "data_source"));
    }

    #[test]
    fn derived_intervals_count_as_supported() {
        // Synthetic streams 1m and 1d; 5m passes because it derives from 1m.
        let (source, tm) = fixture();
        let result = validate_symbol(&req("AAPL", 0), &source, &tm, "US_EQUITY", iv("1m"), date());
        let intervals = result.checks.iter().find(|c| c.name == "intervals").unwrap();
        assert!(intervals.passed);
    }

    #[test]
    fn base_mismatch_fails_check_four() {
        let (source, tm) = fixture();
        let result = validate_symbol(&req("AAPL", 0), &source, &tm, "US_EQUITY", iv("5m"), date());
        assert!(!result.passed());
        assert!(result
            .failures()
            .iter()
            .any(|f| f.starts_with("base_interval")));
    }

    #[test]
    fn no_historical_requirement_skips_the_lookup() {
        let (source, tm) = fixture();
        let result = validate_symbol(&req("AAPL", 0), &source, &tm, "US_EQUITY", iv("1m"), date());
        let hist = result.checks.iter().find(|c| c.name == "historical").unwrap();
        assert!(hist.passed);
    }

    #[test]
    fn off_grid_interval_fails_config_check() {
        let (source, tm) = fixture();
        let mut r = req("AAPL", 0);
        r.base_interval = iv("5m");
        r.required_intervals = vec![iv("5m"), iv("7m")];
        let result = validate_symbol(&r, &source, &tm, "US_EQUITY", iv("5m"), date());
        assert!(!result.passed());
        assert!(result
            .failures()
            .iter()
            .any(|f| f.starts_with("config_requirements") || f.starts_with("intervals")));
    }
}
