// =============================================================================
// Contract identifiers and instrument metadata
// =============================================================================
//
// Gateway contract ids are opaque strings such as `CON.F.US.MNQ.Z25`. They
// are never parsed for trading decisions; the short display symbol is only
// derived for audit messages and price lookups.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

/// Short display symbol for a contract id: the second-to-last dot segment
/// (`CON.F.US.MNQ.Z25` -> `MNQ`). Ids without enough segments are returned
/// unchanged.
pub fn display_symbol(contract_id: &str) -> &str {
    let parts: Vec<&str> = contract_id.split('.').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2]
    } else {
        contract_id
    }
}

/// USD value of a 1.00 price move per contract, keyed by display symbol.
///
/// P&L reconstruction must look point values up here rather than assuming a
/// single instrument.
pub struct InstrumentCatalog {
    point_values: HashMap<&'static str, f64>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        // Micro and e-mini index futures enabled on the gateway account.
        // Extend this table when new products are traded.
        let point_values = HashMap::from([
            ("MNQ", 5.0),
            ("NQ", 20.0),
            ("MES", 5.0),
            ("ES", 50.0),
            ("MYM", 0.5),
            ("YM", 5.0),
            ("M2K", 5.0),
            ("RTY", 50.0),
        ]);
        Self { point_values }
    }

    /// Point value for a display symbol. Unknown symbols fall back to 1.0
    /// with a warning so reconstruction degrades instead of failing.
    pub fn point_value(&self, symbol: &str) -> f64 {
        match self.point_values.get(symbol) {
            Some(v) => *v,
            None => {
                warn!(symbol, "no point value for symbol, using 1.0");
                1.0
            }
        }
    }

    pub fn point_value_for_contract(&self, contract_id: &str) -> f64 {
        self.point_value(display_symbol(contract_id))
    }
}

impl Default for InstrumentCatalog {
    fn default() -> Self {
        Self::new()
    }
}
