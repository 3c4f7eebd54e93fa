// =============================================================================
// Unified Provisioning — analyze, then plan, then execute
// =============================================================================
//
// Every way a symbol, bar interval, or indicator can enter the session goes
// through one three-phase pattern:
//
//   1. Analyze  — build a `ProvisioningRequirements` record from the config,
//                 the session-wide requirements, and what already exists in
//                 SessionData.
//   2. Validate — the five per-symbol checks (see `validation.rs`).
//   3. Plan     — diff "required" against "existing" into an ordered list of
//                 `ProvisioningStep`s.
//
// The planner here is pure; the executor lives on the coordinator, which
// owns the collaborators each step needs (data source, time manager, bar
// queues). The executor aborts on the first failed step — pre-session the
// partial state is cleared by the next teardown, mid-session it is rolled
// back explicitly.
// =============================================================================

use chrono::NaiveDate;

use crate::analyzer::{analyze_indicator_requirements, SessionRequirements};
use crate::calendar::TimeManager;
use crate::config::Config;
use crate::error::CoreResult;
use crate::indicators::IndicatorConfig;
use crate::session_data::SessionData;
use crate::types::{AddedBy, Interval, Mode};

// =============================================================================
// Requirements record
// =============================================================================

/// What kind of thing is being provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Symbol,
    BarInterval,
    Indicator,
}

/// Everything phase 3 needs, gathered in one place.
#[derive(Debug, Clone)]
pub struct ProvisioningRequirements {
    pub op: OpKind,
    pub source: AddedBy,
    pub symbol: String,
    pub base_interval: Interval,
    /// All session intervals the symbol must carry (base first).
    pub required_intervals: Vec<Interval>,
    /// Historical windows to load: interval -> trailing trading days.
    pub historical_windows: Vec<(Interval, u32)>,
    /// Indicators to register (already filtered to the missing ones).
    pub indicators: Vec<IndicatorConfig>,
    pub need_session_load: bool,
    // Existing-state snapshot from SessionData:
    pub symbol_exists: bool,
    pub symbol_is_adhoc: bool,
    pub existing_intervals: Vec<Interval>,
    pub existing_indicators: Vec<String>,
}

impl ProvisioningRequirements {
    pub fn need_historical(&self) -> bool {
        !self.historical_windows.is_empty()
    }

    /// Full loading applies to config-declared symbols and strategy adds;
    /// scanner/adhoc provisioning is minimal (no quality pass).
    pub fn is_full_load(&self) -> bool {
        matches!(self.source, AddedBy::Config | AddedBy::Strategy)
    }
}

// =============================================================================
// Phase 1 — analyze
// =============================================================================

/// Build the requirements record for one operation.
///
/// For `OpKind::Symbol` the target is full session membership: every
/// session-wide interval, the configured historical windows plus indicator
/// warmups, and all configured session indicators. For `OpKind::Indicator`
/// (the adhoc path) only the indicator's own interval and minimal warmup
/// window are required.
#[allow(clippy::too_many_arguments)]
pub fn analyze_requirements(
    op: OpKind,
    symbol: &str,
    source: AddedBy,
    session_reqs: &SessionRequirements,
    config: &Config,
    session: &SessionData,
    time_manager: &TimeManager,
    session_date: NaiveDate,
    indicator: Option<IndicatorConfig>,
) -> CoreResult<ProvisioningRequirements> {
    let exchange = config.exchange_group.as_str();
    let base = session_reqs.base_interval;

    // What already exists for this symbol (internal read: analysis also runs
    // while the session gate is down during mid-session insertion).
    let existing = session.with_symbol(symbol, true, |sd| {
        (
            sd.bars.keys().copied().collect::<Vec<_>>(),
            sd.indicators.keys().cloned().collect::<Vec<_>>(),
            !sd.meta.meets_session_config_requirements,
        )
    });
    let (existing_intervals, existing_indicators, symbol_is_adhoc) = match existing {
        Some((mut ivs, inds, adhoc)) => {
            ivs.sort();
            (ivs, inds, adhoc)
        }
        None => (Vec::new(), Vec::new(), false),
    };
    let symbol_exists = !existing_intervals.is_empty();

    let mut required_intervals = vec![base];
    let mut historical_windows: Vec<(Interval, u32)> = Vec::new();
    let mut indicators: Vec<IndicatorConfig> = Vec::new();

    match op {
        OpKind::Symbol => {
            required_intervals.extend(session_reqs.derivable.iter().copied());

            historical_windows = config.historical_intervals()?;

            for spec in &config.session_data_config.indicators.session {
                let cfg = IndicatorConfig::from_spec(spec)?;
                if !required_intervals.contains(&cfg.interval) {
                    required_intervals.push(cfg.interval);
                }
                let needs = analyze_indicator_requirements(
                    &cfg,
                    time_manager,
                    config.runtime.warmup_multiplier,
                    session_date,
                    exchange,
                )?;
                merge_window(&mut historical_windows, cfg.interval, needs.trading_days);
                indicators.push(cfg);
            }
        }
        OpKind::BarInterval | OpKind::Indicator => {
            if let Some(cfg) = indicator {
                if !required_intervals.contains(&cfg.interval) {
                    required_intervals.push(cfg.interval);
                }
                let needs = analyze_indicator_requirements(
                    &cfg,
                    time_manager,
                    config.runtime.warmup_multiplier,
                    session_date,
                    exchange,
                )?;
                merge_window(&mut historical_windows, cfg.interval, needs.trading_days);
                indicators.push(cfg);
            }
        }
    }

    required_intervals.sort();
    required_intervals.dedup();

    // Only register what is missing.
    indicators.retain(|cfg| !existing_indicators.contains(&cfg.name));

    Ok(ProvisioningRequirements {
        op,
        source,
        symbol: symbol.to_string(),
        base_interval: base,
        required_intervals,
        historical_windows,
        indicators,
        need_session_load: config.mode == Mode::Backtest,
        symbol_exists,
        symbol_is_adhoc,
        existing_intervals,
        existing_indicators,
    })
}

fn merge_window(windows: &mut Vec<(Interval, u32)>, interval: Interval, days: u32) {
    if let Some(entry) = windows.iter_mut().find(|(iv, _)| *iv == interval) {
        entry.1 = entry.1.max(days);
    } else {
        windows.push((interval, days));
    }
}

// =============================================================================
// Phase 3 — plan
// =============================================================================

/// One unit of provisioning work, executed in order by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningStep {
    CreateSymbol,
    /// Flip an adhoc symbol to full membership.
    UpgradeSymbol,
    AddInterval(Interval),
    LoadHistorical,
    /// Fill the backtest queues with the current session date's bars.
    LoadSession,
    RegisterIndicator(String),
    CalculateQuality,
}

/// Diff required-vs-existing into an ordered step list. An empty list means
/// the operation is a no-op (e.g. re-adding an already-loaded symbol).
pub fn determine_steps(req: &ProvisioningRequirements) -> Vec<ProvisioningStep> {
    let mut steps = Vec::new();

    let creating = !req.symbol_exists;
    let upgrading = req.symbol_exists && req.symbol_is_adhoc && req.is_full_load();

    if creating {
        steps.push(ProvisioningStep::CreateSymbol);
    } else if upgrading {
        steps.push(ProvisioningStep::UpgradeSymbol);
    }

    for iv in &req.required_intervals {
        let installed_by_create = creating && *iv == req.base_interval;
        if !installed_by_create && !req.existing_intervals.contains(iv) {
            steps.push(ProvisioningStep::AddInterval(*iv));
        }
    }

    if req.need_historical() && (creating || upgrading || req.op == OpKind::Indicator) {
        steps.push(ProvisioningStep::LoadHistorical);
    }

    if req.need_session_load && creating {
        steps.push(ProvisioningStep::LoadSession);
    }

    for cfg in &req.indicators {
        steps.push(ProvisioningStep::RegisterIndicator(cfg.name.clone()));
    }

    // Quality scoring belongs to full loads only; adhoc symbols get scored
    // when (and if) they are upgraded.
    if req.is_full_load() && steps.iter().any(|s| !matches!(s, ProvisioningStep::CalculateQuality)) {
        steps.push(ProvisioningStep::CalculateQuality);
    }

    steps
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_session_requirements;
    use crate::session_data::SymbolSessionData;
    use crate::types::Mode;

    fn iv(tag: &str) -> Interval {
        Interval::parse(tag).unwrap()
    }

    fn config_json(historical: bool) -> Config {
        let hist = if historical {
            r#""historical": { "enabled": true, "data": [ { "interval": "1m", "trailing_days": 3 } ] },"#
        } else {
            ""
        };
        let json = format!(
            r#"{{
                "mode": "backtest",
                "backtest_config": {{ "start_date": "2025-07-01", "end_date": "2025-07-02" }},
                "session_data_config": {{
                    "symbols": ["RIVN"],
                    "streams": ["1m", "5m"],
                    {hist}
                    "indicators": {{ "session": [], "historical": [] }}
                }}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn fixture(historical: bool) -> (Config, SessionRequirements, SessionData, TimeManager) {
        let config = config_json(historical);
        let reqs = analyze_session_requirements(&[iv("1m"), iv("5m")], &[]).unwrap();
        let session = SessionData::new();
        let tm = TimeManager::new(Mode::Backtest, "US_EQUITY");
        (config, reqs, session, tm)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 2).unwrap()
    }

    #[test]
    fn fresh_config_symbol_gets_the_full_plan() {
        let (config, reqs, session, tm) = fixture(true);
        let req = analyze_requirements(
            OpKind::Symbol,
            "RIVN",
            AddedBy::Config,
            &reqs,
            &config,
            &session,
            &tm,
            date(),
            None,
        )
        .unwrap();

        assert!(!req.symbol_exists);
        assert_eq!(req.required_intervals, vec![iv("1m"), iv("5m")]);
        assert_eq!(req.historical_windows, vec![(iv("1m"), 3)]);

        let steps = determine_steps(&req);
        assert_eq!(
            steps,
            vec![
                ProvisioningStep::CreateSymbol,
                ProvisioningStep::AddInterval(iv("5m")),
                ProvisioningStep::LoadHistorical,
                ProvisioningStep::LoadSession,
                ProvisioningStep::CalculateQuality,
            ]
        );
    }

    #[test]
    fn re_adding_a_loaded_symbol_is_a_no_op() {
        let (config, reqs, session, tm) = fixture(false);
        let mut sd = SymbolSessionData::new("RIVN", iv("1m"), AddedBy::Config);
        sd.add_interval(iv("5m")).unwrap();
        session.register_symbol_data(sd).unwrap();

        let req = analyze_requirements(
            OpKind::Symbol,
            "RIVN",
            AddedBy::Strategy,
            &reqs,
            &config,
            &session,
            &tm,
            date(),
            None,
        )
        .unwrap();
        assert!(req.symbol_exists);
        assert!(!req.symbol_is_adhoc);
        assert!(determine_steps(&req).is_empty());
    }

    #[test]
    fn adhoc_symbol_upgrades_on_strategy_add() {
        let (config, reqs, session, tm) = fixture(true);
        let mut sd = SymbolSessionData::new("MSFT", iv("1m"), AddedBy::Scanner);
        sd.add_interval(iv("5m")).unwrap();
        session.register_symbol_data(sd).unwrap();

        let req = analyze_requirements(
            OpKind::Symbol,
            "MSFT",
            AddedBy::Strategy,
            &reqs,
            &config,
            &session,
            &tm,
            date(),
            None,
        )
        .unwrap();
        assert!(req.symbol_is_adhoc);

        let steps = determine_steps(&req);
        assert_eq!(steps[0], ProvisioningStep::UpgradeSymbol);
        assert!(steps.contains(&ProvisioningStep::LoadHistorical));
        assert!(steps.contains(&ProvisioningStep::CalculateQuality));
        assert!(!steps.contains(&ProvisioningStep::CreateSymbol));
        // Both intervals already exist.
        assert!(!steps.iter().any(|s| matches!(s, ProvisioningStep::AddInterval(_))));
    }

    #[test]
    fn adhoc_indicator_plan_is_minimal() {
        let (config, reqs, session, tm) = fixture(false);
        let spec = crate::config::IndicatorSpec {
            name: "sma_20_5m".into(),
            kind: "sma".into(),
            period: 20,
            interval: "5m".into(),
            params: serde_json::Value::Null,
        };
        let cfg = IndicatorConfig::from_spec(&spec).unwrap();

        let req = analyze_requirements(
            OpKind::Indicator,
            "MSFT",
            AddedBy::Scanner,
            &reqs,
            &config,
            &session,
            &tm,
            date(),
            Some(cfg),
        )
        .unwrap();

        assert!(!req.is_full_load());
        // Minimal warmup window on the indicator's own interval.
        assert_eq!(req.historical_windows.len(), 1);
        assert_eq!(req.historical_windows[0].0, iv("5m"));

        let steps = determine_steps(&req);
        assert_eq!(
            steps,
            vec![
                ProvisioningStep::CreateSymbol,
                ProvisioningStep::AddInterval(iv("5m")),
                ProvisioningStep::LoadHistorical,
                ProvisioningStep::LoadSession,
                ProvisioningStep::RegisterIndicator("sma_20_5m".into()),
            ]
        );
        // No CalculateQuality for adhoc loads.
        assert!(!steps.contains(&ProvisioningStep::CalculateQuality));
    }

    #[test]
    fn session_indicators_extend_required_intervals_and_windows() {
        let (mut config, _, session, tm) = fixture(true);
        config.session_data_config.indicators.session.push(crate::config::IndicatorSpec {
            name: "ema_9_15m".into(),
            kind: "ema".into(),
            period: 9,
            interval: "15m".into(),
            params: serde_json::Value::Null,
        });
        let reqs = analyze_session_requirements(&[iv("1m"), iv("5m")], &[iv("15m")]).unwrap();

        let req = analyze_requirements(
            OpKind::Symbol,
            "RIVN",
            AddedBy::Config,
            &reqs,
            &config,
            &session,
            &tm,
            date(),
            None,
        )
        .unwrap();

        assert!(req.required_intervals.contains(&iv("15m")));
        assert!(req.historical_windows.iter().any(|(i, d)| *i == iv("15m") && *d >= 1));
        assert_eq!(req.indicators.len(), 1);
    }
}
