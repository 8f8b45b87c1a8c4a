//! Bank registry.
//!
//! Every supported source id maps to one `RateCollector` built from a
//! declarative rule. Bank-specific knowledge lives only in this module;
//! the rest of the application goes through the `RateCollector` trait.

pub mod json_api;
pub mod pdf;
pub mod table;

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::collector::{Flavor, RateCollector, Source};
use crate::config::Config;
use json_api::JsonApiCollector;
use pdf::{PdfRateCollector, SBI_USD_ROW};
use table::{
    HtmlTableCollector, RateColumn, RenderedTableCollector, RowMatch, TT_BUY_HEADERS, TableRule,
};

/// Returns the collector for a source id.
///
/// CONTRACT:
/// - `id` MUST match `sources[].id` in config.json
/// - Ids are lowercase and stable; they also key the endpoint map
///
/// Collectors are stateless values, wrapped in `Arc` so one instance
/// can be shared by the orchestrator and its tasks.
pub fn get_collector(id: &str) -> Option<Arc<dyn RateCollector>> {
    match id {
        // Rendered pages (one browser session each)
        "kotak" => Some(Arc::new(RenderedTableCollector {
            bank: "Kotak Bank",
            ready_selector: "table.table_1",
            settle: Duration::ZERO,
            rule: TableRule {
                table_selector: "table.table_1",
                last_table_only: true,
                row: RowMatch::FirstCellContains("USD"),
                column: RateColumn::Index(&[1]),
                min_cells: 2,
            },
        })),
        "iob" => Some(Arc::new(RenderedTableCollector {
            bank: "Indian Overseas Bank",
            ready_selector: ".Gridview",
            settle: Duration::ZERO,
            rule: TableRule {
                table_selector: ".Gridview",
                last_table_only: false,
                row: RowMatch::CellEquals(1, "USD"),
                column: RateColumn::Index(&[4]),
                min_cells: 6,
            },
        })),
        "idfc" => Some(Arc::new(RenderedTableCollector {
            bank: "IDFC First Bank",
            ready_selector: "table",
            settle: Duration::from_secs(5),
            rule: TableRule {
                table_selector: "table",
                last_table_only: false,
                row: RowMatch::AnyCellContains("USD"),
                column: RateColumn::Index(&[3, 4]),
                min_cells: 5,
            },
        })),
        "boi" => Some(Arc::new(RenderedTableCollector {
            bank: "Bank of India",
            ready_selector: "table.table",
            settle: Duration::ZERO,
            rule: TableRule {
                table_selector: "table.table",
                last_table_only: false,
                row: RowMatch::AnyCellContains("USD"),
                column: RateColumn::Index(&[3]),
                min_cells: 4,
            },
        })),

        // Plain HTTP
        "bob" => Some(Arc::new(HtmlTableCollector {
            bank: "Bank of Baroda",
            rule: TableRule {
                table_selector: "table",
                last_table_only: false,
                row: RowMatch::AnyCellContains("USD"),
                column: RateColumn::Header(TT_BUY_HEADERS),
                min_cells: 2,
            },
        })),
        "canara" => Some(Arc::new(HtmlTableCollector {
            bank: "Canara Bank",
            rule: TableRule {
                table_selector: "table",
                last_table_only: false,
                row: RowMatch::AnyCellContains("USD"),
                column: RateColumn::Index(&[3]),
                min_cells: 4,
            },
        })),
        "hsbc" => Some(Arc::new(HtmlTableCollector {
            bank: "HSBC",
            rule: TableRule {
                table_selector: "table.desktop",
                last_table_only: false,
                row: RowMatch::FirstCellContains("USD"),
                column: RateColumn::Index(&[3]),
                min_cells: 4,
            },
        })),
        "yes" => Some(Arc::new(JsonApiCollector {
            bank: "Yes Bank",
            payload: r#"{"rateType":"NRI","currency":"USD","amount":"1"}"#,
            paths: &["data.ttBuyRate", "rates.ttBuyRate", "ttBuyRate", "data.rates.buy"],
            referer: Some("https://www.yesbank.in/nri-banking/forex-services/forex-rates"),
            origin: Some("https://www.yesbank.in"),
        })),
        "sbi" => Some(Arc::new(PdfRateCollector {
            bank: "SBI",
            link_text: "FOREX CARD RATES",
            pattern: &SBI_USD_ROW,
        })),
        _ => None,
    }
}

/// Resolves enabled config entries into run-ready sources.
///
/// Order: stateful sources first, then stateless, each group keeping
/// its configured order. This is the order the status board shows.
/// Unknown ids are logged and skipped; a missing endpoint is kept as
/// `None` and fails at collection time.
pub fn resolve_sources(cfg: &Config) -> Vec<Source> {
    let mut stateful = Vec::new();
    let mut stateless = Vec::new();

    for id in cfg.enabled_sources() {
        let Some(collector) = get_collector(id) else {
            warn!("source '{id}' is not supported, skipping");
            continue;
        };
        let source = Source::new(id, cfg.endpoints.get(id).cloned(), collector);
        match source.flavor() {
            Flavor::Stateful => stateful.push(source),
            Flavor::Stateless => stateless.push(source),
        }
    }

    stateful.extend(stateless);
    stateful
}
