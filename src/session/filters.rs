// =============================================================================
// Per-channel subscription filters
// =============================================================================
//
// The only recognised filter key today is `symbols`: when present, aggregate
// messages are narrowed to the matching entries and per-instrument messages
// are dropped unless their symbol is in the set. Unrecognised keys are kept
// verbatim in `raw` so `{type:"subscribed", ...}` echoes exactly what the
// client sent, but they have no filtering effect.
// =============================================================================

use std::collections::HashSet;

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub symbols: Option<HashSet<String>>,
    pub raw: Value,
}

impl Filters {
    pub fn from_value(raw: Option<Value>) -> Self {
        let raw = raw.unwrap_or(Value::Null);
        let symbols = raw
            .get("symbols")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_string).collect());
        Self { symbols, raw }
    }

    /// Whether a per-instrument message for `symbol` should be delivered to a
    /// session holding these filters.
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        match &self.symbols {
            Some(set) => set.contains(symbol),
            None => true,
        }
    }

    /// Narrow an aggregate message's `stocks`/`indices` array to only the
    /// entries this filter allows, returning `None` when nothing passes.
    pub fn narrow_records<'a, T>(&self, records: &'a [T], key_of: impl Fn(&T) -> &str) -> Option<Vec<&'a T>> {
        let Some(set) = &self.symbols else {
            return Some(records.iter().collect());
        };
        let narrowed: Vec<&T> = records.iter().filter(|r| set.contains(key_of(r))).collect();
        if narrowed.is_empty() {
            None
        } else {
            Some(narrowed)
        }
    }
}
