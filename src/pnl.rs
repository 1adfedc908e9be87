//! P&L Engine. Pure, deterministic, no I/O.

use std::collections::BTreeMap;

use crate::broker::{PositionbookEntry, TradebookEntry};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolPnl {
    pub symbol: String,
    pub realized: f64,
    pub unrealized: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountTotals {
    pub realized: f64,
    pub unrealized: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PnlReport {
    pub by_symbol: Vec<SymbolPnl>,
    pub totals: AccountTotals,
}

/// Realized P&L by symbol from a tradebook.
///
/// Trades are aggregated into weighted averages per symbol irrespective of
/// ordering, not FIFO lot-matching. For each symbol: `avg_buy = Σ(price·qty)/Σqty` over
/// BUY trades (0 if none), `avg_sell` analogously over SELL trades,
/// `closed_qty = min(buy_qty, sell_qty)`, realized = `(avg_sell - avg_buy) *
/// closed_qty`.
pub fn calculate_realized_pnl(trades: &[TradebookEntry]) -> BTreeMap<String, f64> {
    #[derive(Default)]
    struct Agg {
        buy_value: f64,
        buy_qty: f64,
        sell_value: f64,
        sell_qty: f64,
    }

    let mut by_symbol: BTreeMap<String, Agg> = BTreeMap::new();

    for trade in trades {
        let agg = by_symbol.entry(trade.symbol.clone()).or_default();
        match trade.action.to_uppercase().as_str() {
            "BUY" => {
                agg.buy_value += trade.price * trade.quantity;
                agg.buy_qty += trade.quantity;
            }
            "SELL" => {
                agg.sell_value += trade.price * trade.quantity;
                agg.sell_qty += trade.quantity;
            }
            _ => {}
        }
    }

    by_symbol
        .into_iter()
        .map(|(symbol, agg)| {
            let avg_buy = if agg.buy_qty > 0.0 {
                agg.buy_value / agg.buy_qty
            } else {
                0.0
            };
            let avg_sell = if agg.sell_qty > 0.0 {
                agg.sell_value / agg.sell_qty
            } else {
                0.0
            };
            let closed_qty = agg.buy_qty.min(agg.sell_qty);
            let realized = (avg_sell - avg_buy) * closed_qty;
            (symbol, realized)
        })
        .collect()
}

/// Unrealized P&L by symbol from a positionbook. The upstream supplies the
/// signed value directly; this never recomputes from LTP.
pub fn calculate_unrealized_pnl(positions: &[PositionbookEntry]) -> BTreeMap<String, f64> {
    let mut by_symbol: BTreeMap<String, f64> = BTreeMap::new();
    for position in positions {
        *by_symbol.entry(position.symbol.clone()).or_insert(0.0) += position.pnl.unwrap_or(0.0);
    }
    by_symbol
}

/// Per-symbol aggregate and account totals from a tradebook + positionbook,
/// with the fallback semantics: if only one side is available, the
/// other contributes 0 / the raw positionbook sum respectively. Callers that
/// observed an upstream failure on one side pass `None` for that side.
pub fn aggregate(
    trades: Option<&[TradebookEntry]>,
    positions: Option<&[PositionbookEntry]>,
) -> PnlReport {
    let realized = trades
        .map(calculate_realized_pnl)
        .unwrap_or_default();
    let unrealized = positions
        .map(calculate_unrealized_pnl)
        .unwrap_or_default();

    let mut symbols: Vec<String> = realized.keys().chain(unrealized.keys()).cloned().collect();
    symbols.sort();
    symbols.dedup();

    let mut totals = AccountTotals::default();
    let by_symbol = symbols
        .into_iter()
        .map(|symbol| {
            let r = realized.get(&symbol).copied().unwrap_or(0.0);
            let u = unrealized.get(&symbol).copied().unwrap_or(0.0);
            totals.realized += r;
            totals.unrealized += u;
            SymbolPnl {
                symbol,
                realized: r,
                unrealized: u,
                total: r + u,
            }
        })
        .collect();
    totals.total = totals.realized + totals.unrealized;

    PnlReport { by_symbol, totals }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, action: &str, price: f64, quantity: f64) -> TradebookEntry {
        TradebookEntry {
            symbol: symbol.to_string(),
            action: action.to_string(),
            price,
            quantity,
        }
    }

    #[test]
    fn realized_pnl_aggregation_scenario() {
        let trades = vec![
            trade("A", "BUY", 100.0, 10.0),
            trade("A", "BUY", 110.0, 10.0),
            trade("A", "SELL", 120.0, 15.0),
        ];
        let realized = calculate_realized_pnl(&trades);
        assert!((realized["A"] - 225.0).abs() < 1e-9);
    }

    #[test]
    fn realized_pnl_is_permutation_invariant() {
        let trades = vec![
            trade("A", "BUY", 100.0, 10.0),
            trade("A", "BUY", 110.0, 10.0),
            trade("A", "SELL", 120.0, 15.0),
        ];
        let mut shuffled = trades.clone();
        shuffled.reverse();

        assert_eq!(calculate_realized_pnl(&trades), calculate_realized_pnl(&shuffled));
    }

    #[test]
    fn zero_divisor_yields_zero_average() {
        let trades = vec![trade("B", "SELL", 50.0, 5.0)];
        let realized = calculate_realized_pnl(&trades);
        // avg_buy = 0, closed_qty = min(0, 5) = 0 => realized = 0
        assert_eq!(realized["B"], 0.0);
    }

    #[test]
    fn unrealized_pnl_sums_positions_without_recompute() {
        let positions = vec![
            PositionbookEntry {
                symbol: "A".to_string(),
                netqty: 5.0,
                pnl: Some(42.5),
            },
            PositionbookEntry {
                symbol: "A".to_string(),
                netqty: -2.0,
                pnl: None,
            },
        ];
        let unrealized = calculate_unrealized_pnl(&positions);
        assert_eq!(unrealized["A"], 42.5);
    }

    #[test]
    fn aggregate_fallback_when_tradebook_unavailable() {
        let positions = vec![PositionbookEntry {
            symbol: "A".to_string(),
            netqty: 1.0,
            pnl: Some(10.0),
        }];
        let report = aggregate(None, Some(&positions));
        assert_eq!(report.totals.realized, 0.0);
        assert_eq!(report.totals.unrealized, 10.0);
        assert_eq!(report.totals.total, 10.0);
    }

    #[test]
    fn aggregate_both_unavailable_is_all_zero() {
        let report = aggregate(None, None);
        assert_eq!(report.totals, AccountTotals::default());
        assert!(report.by_symbol.is_empty());
    }
}
