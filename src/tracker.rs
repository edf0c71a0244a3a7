// =============================================================================
// Position Tracker — per-contract open lots reconstructed from fills
// =============================================================================
//
// A contract has either zero or one tracked lot. Same-side fills update the
// weighted-average entry; opposite-side fills reduce the lot, realizing P&L
// at the fill price, and a fill larger than the lot flips it (close all,
// reopen the remainder on the filling side).
//
// The tracker is rebuilt from the broker's authoritative position query on
// startup and is never persisted. The daily accumulator is owned by the P&L
// engine; the realized figure computed here is informational and feeds the
// reconstruction fallback for closes the stream under-reports.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, info};

use crate::contract::InstrumentCatalog;
use crate::events::{OrderFill, PositionType};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedLot {
    pub avg_entry_price: f64,
    pub size: u32,
    pub side: PositionType,
}

/// Outcome of applying one fill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillEffect {
    /// P&L realized locally by reducing or flipping a lot, in USD.
    pub realized: Option<f64>,
    /// True when the fill took an existing lot to zero (including flips).
    pub closed_existing: bool,
}

pub struct PositionTracker {
    lots: HashMap<String, TrackedLot>,
    catalog: InstrumentCatalog,
}

impl PositionTracker {
    pub fn new(catalog: InstrumentCatalog) -> Self {
        Self {
            lots: HashMap::new(),
            catalog,
        }
    }

    pub fn get(&self, contract_id: &str) -> Option<&TrackedLot> {
        self.lots.get(contract_id)
    }

    pub fn remove(&mut self, contract_id: &str) -> Option<TrackedLot> {
        self.lots.remove(contract_id)
    }

    pub fn clear(&mut self) {
        self.lots.clear();
    }

    pub fn len(&self) -> usize {
        self.lots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn point_value(&self, contract_id: &str) -> f64 {
        self.catalog.point_value_for_contract(contract_id)
    }

    // -------------------------------------------------------------------------
    // Fill transitions
    // -------------------------------------------------------------------------

    pub fn apply_fill(&mut self, fill: &OrderFill) -> FillEffect {
        if fill.size == 0 {
            return FillEffect::default();
        }

        let incoming = PositionType::from_side(fill.side);
        let point_value = self.catalog.point_value_for_contract(&fill.contract_id);

        let Some(lot) = self.lots.get_mut(&fill.contract_id) else {
            self.lots.insert(
                fill.contract_id.clone(),
                TrackedLot {
                    avg_entry_price: fill.filled_price,
                    size: fill.size,
                    side: incoming,
                },
            );
            info!(
                contract = %fill.contract_id,
                side = fill.side.as_str(),
                size = fill.size,
                price = fill.filled_price,
                "tracked new lot"
            );
            return FillEffect::default();
        };

        if lot.side == incoming {
            // Same side: weighted-average entry, larger lot.
            let total = lot.size + fill.size;
            lot.avg_entry_price = (lot.size as f64 * lot.avg_entry_price
                + fill.size as f64 * fill.filled_price)
                / total as f64;
            lot.size = total;
            info!(
                contract = %fill.contract_id,
                size = lot.size,
                avg_entry = lot.avg_entry_price,
                "lot increased"
            );
            return FillEffect::default();
        }

        // Opposite side: reduce, close, or flip.
        if lot.size > fill.size {
            let realized =
                realized_on_close(lot.side, lot.avg_entry_price, fill.filled_price, fill.size, point_value);
            lot.size -= fill.size;
            debug!(
                contract = %fill.contract_id,
                closed = fill.size,
                remaining = lot.size,
                realized,
                "lot reduced"
            );
            FillEffect {
                realized: Some(realized),
                closed_existing: false,
            }
        } else if lot.size == fill.size {
            let realized =
                realized_on_close(lot.side, lot.avg_entry_price, fill.filled_price, lot.size, point_value);
            self.lots.remove(&fill.contract_id);
            info!(
                contract = %fill.contract_id,
                realized,
                "lot closed by opposite fill"
            );
            FillEffect {
                realized: Some(realized),
                closed_existing: true,
            }
        } else {
            // Flip: realize the whole outgoing lot, reopen the remainder at
            // the fill price on the filling side.
            let realized =
                realized_on_close(lot.side, lot.avg_entry_price, fill.filled_price, lot.size, point_value);
            let remainder = fill.size - lot.size;
            *lot = TrackedLot {
                avg_entry_price: fill.filled_price,
                size: remainder,
                side: incoming,
            };
            info!(
                contract = %fill.contract_id,
                realized,
                reopened = remainder,
                side = fill.side.as_str(),
                "lot flipped"
            );
            FillEffect {
                realized: Some(realized),
                closed_existing: true,
            }
        }
    }

    /// Overwrite the lot from an authoritative `PositionUpdated` snapshot
    /// (non-zero size).
    pub fn apply_snapshot(
        &mut self,
        contract_id: &str,
        size: i64,
        average_price: f64,
        position_type: PositionType,
    ) {
        if size == 0 {
            return;
        }
        self.lots.insert(
            contract_id.to_string(),
            TrackedLot {
                avg_entry_price: average_price,
                size: size.unsigned_abs() as u32,
                side: position_type,
            },
        );
        debug!(
            contract = %contract_id,
            size = size.abs(),
            avg_entry = average_price,
            "lot snapshot applied"
        );
    }
}

fn realized_on_close(
    side: PositionType,
    avg_entry: f64,
    exit_price: f64,
    closed_size: u32,
    point_value: f64,
) -> f64 {
    let size = closed_size as f64;
    match side {
        PositionType::Long => (exit_price - avg_entry) * size * point_value,
        PositionType::Short => (avg_entry - exit_price) * size * point_value,
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("lots", &self.lots.len())
            .finish()
    }
}
