// =============================================================================
// SessionData JSON export
// =============================================================================
//
// Deterministic structure used for inter-process inspection and testing. Bars
// are serialised as `{columns, data}` arrays (CSV-shaped) for compactness,
// with timestamps as UTC epoch seconds — the one place the engine converts
// out of the exchange timezone.
//
// `complete = false` emits only the bar rows appended since the previous
// export call, tracked by per-(symbol, interval) cursors. Everything else
// (counts, quality, metadata) is always current.
// =============================================================================

use serde_json::{json, Value};

use super::symbol::{BarIntervalData, Gap, SymbolSessionData};
use super::SessionData;
use crate::types::Bar;

const BAR_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

fn bar_row(bar: &Bar) -> Value {
    json!([
        bar.timestamp.timestamp(),
        bar.open,
        bar.high,
        bar.low,
        bar.close,
        bar.volume
    ])
}

fn gap_json(gap: &Gap) -> Value {
    json!({
        "start_time": gap.start_time.timestamp(),
        "end_time": gap.end_time.timestamp(),
        "start": gap.start_time.format("%H:%M").to_string(),
        "end": gap.end_time.format("%H:%M").to_string(),
        "bar_count": gap.bar_count,
        "retry_count": gap.retry_count,
    })
}

fn interval_json(series: &BarIntervalData, rows_from: usize) -> Value {
    let rows: Vec<Value> = series.data[rows_from.min(series.data.len())..]
        .iter()
        .map(bar_row)
        .collect();
    json!({
        "derived": series.derived,
        "base": series.base.map(|b| b.to_string()),
        "quality": series.quality,
        "gaps": series.gaps.iter().map(gap_json).collect::<Vec<_>>(),
        "count": series.data.len(),
        "data": { "columns": BAR_COLUMNS, "data": rows },
    })
}

fn symbol_json(sd: &SymbolSessionData, mut cursor_for: impl FnMut(&str, usize) -> usize) -> Value {
    let mut bars = serde_json::Map::new();
    let mut tags: Vec<_> = sd.bars.keys().copied().collect();
    tags.sort();
    for iv in tags {
        let series = &sd.bars[&iv];
        let from = cursor_for(&iv.to_string(), series.data.len());
        bars.insert(iv.to_string(), interval_json(series, from));
    }

    let mut indicators = serde_json::Map::new();
    let mut names: Vec<_> = sd.indicators.keys().cloned().collect();
    names.sort();
    for name in names {
        let ind = &sd.indicators[&name];
        indicators.insert(
            name,
            json!({
                "category": ind.config.kind.as_str(),
                "interval": ind.config.interval.to_string(),
                "period": ind.config.period,
                "current_value": ind.current_value.map(|v| v.to_json()),
                "valid": ind.valid,
                "last_updated": ind.last_updated.map(|t| t.timestamp()),
            }),
        );
    }

    let mut historical = serde_json::Map::new();
    let mut hist_tags: Vec<_> = sd.historical.bars.keys().copied().collect();
    hist_tags.sort();
    for iv in hist_tags {
        let hist = &sd.historical.bars[&iv];
        let days: serde_json::Map<String, Value> = hist
            .data_by_date
            .iter()
            .map(|(date, bars)| (date.to_string(), json!(bars.len())))
            .collect();
        historical.insert(
            iv.to_string(),
            json!({
                "date_range": hist.date_range.map(|(a, b)| [a.to_string(), b.to_string()]),
                "quality": hist.quality,
                "gaps": hist.gaps.iter().map(gap_json).collect::<Vec<_>>(),
                "bars_per_date": days,
                "total_bars": hist.total_bars(),
            }),
        );
    }

    json!({
        "symbol": sd.symbol,
        "base_interval": sd.base_interval.to_string(),
        "bars": bars,
        "quotes": sd.quotes.len(),
        "ticks": sd.ticks.len(),
        "metrics": {
            "volume": sd.metrics.volume,
            "high": if sd.metrics.high.is_finite() { Some(sd.metrics.high) } else { None },
            "low": if sd.metrics.low.is_finite() { Some(sd.metrics.low) } else { None },
            "last_update": sd.metrics.last_update.map(|t| t.timestamp()),
        },
        "indicators": indicators,
        "historical": {
            "bars": historical,
            "indicators": sd.historical.indicators,
        },
        "metadata": {
            "meets_session_config_requirements": sd.meta.meets_session_config_requirements,
            "added_by": sd.meta.added_by.to_string(),
            "auto_provisioned": sd.meta.auto_provisioned,
            "added_at": sd.meta.added_at.to_rfc3339(),
            "upgraded_from_adhoc": sd.meta.upgraded_from_adhoc,
        },
    })
}

impl SessionData {
    /// Serialise the session tree. With `complete = false`, bar rows are
    /// emitted incrementally: only rows appended since the previous export
    /// call appear, and the internal cursors advance. A `complete = true`
    /// export emits everything and resets the cursors to the current end.
    pub fn export(&self, complete: bool) -> Value {
        let mut store = self.inner.write();

        let mut symbols = serde_json::Map::new();
        let mut names: Vec<String> = store.symbols.keys().cloned().collect();
        names.sort();

        // Collect cursor updates outside the per-symbol closure to keep the
        // borrow on `store.symbols` undisturbed.
        let mut new_cursors: Vec<((String, crate::types::Interval), usize)> = Vec::new();

        for name in names {
            let sd = &store.symbols[&name];
            let cursors = &store.export_cursors;
            let sym = name.clone();
            let value = symbol_json(sd, |tag, len| {
                let iv = crate::types::Interval::parse(tag).expect("exported tag is canonical");
                let from = if complete {
                    0
                } else {
                    cursors.get(&(sym.clone(), iv)).copied().unwrap_or(0)
                };
                new_cursors.push(((sym.clone(), iv), len));
                from.min(len)
            });
            symbols.insert(name, value);
        }

        for (key, len) in new_cursors {
            store.export_cursors.insert(key, len);
        }

        json!({
            "complete": complete,
            "session_active": store.session_active,
            "current_session_date": store.current_session_date.map(|d| d.to_string()),
            "symbols": symbols,
        })
    }
}
