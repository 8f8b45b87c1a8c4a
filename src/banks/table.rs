//! HTML table extraction, shared by static and browser-rendered pages.
//!
//! A bank page is described declaratively by a `TableRule`: which
//! tables to look at, how to recognise the USD row and where the
//! TT buy value sits in that row.

use std::time::Duration;

use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};

use crate::collector::session::RenderRequest;
use crate::collector::{CollectContext, Flavor, RateCollector};
use crate::error::CollectError;
use crate::util::parse_rate;

/// Header spellings of the TT buy column, compared without whitespace.
pub const TT_BUY_HEADERS: &[&str] = &["TTBUY", "TT BUY", "TTB", "TT BUYING"];

#[derive(Debug, Clone, Copy)]
pub enum RowMatch {
    /// First cell contains the needle ("USD Dollar", "USD")
    FirstCellContains(&'static str),
    /// Cell `n` equals the needle after trimming
    CellEquals(usize, &'static str),
    /// Any cell contains the needle
    AnyCellContains(&'static str),
}

impl RowMatch {
    fn matches(&self, cells: &[String]) -> bool {
        match *self {
            Self::FirstCellContains(n) => cells.first().is_some_and(|c| c.contains(n)),
            Self::CellEquals(i, n) => cells.get(i).is_some_and(|c| c == n),
            Self::AnyCellContains(n) => cells.iter().any(|c| c.to_uppercase().contains(n)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RateColumn {
    /// Fixed column positions, tried in order
    Index(&'static [usize]),
    /// Column located through the first row's headers
    Header(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct TableRule {
    pub table_selector: &'static str,
    /// Only the last matching table holds rates (Kotak)
    pub last_table_only: bool,
    pub row: RowMatch,
    pub column: RateColumn,
    /// Rows with fewer cells are skipped
    pub min_cells: usize,
}

/// Applies `rule` to an HTML document.
///
/// Returns the first positive value found. If USD rows exist but none
/// holds a usable number, the error is `ValueUnparsable`; if no row
/// matches at all, `StructureNotRecognized`.
pub fn extract_rate(html: &str, rule: &TableRule) -> Result<Decimal, CollectError> {
    let doc = Html::parse_document(html);
    let table_sel = selector(rule.table_selector)?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;

    let tables: Vec<ElementRef> = doc.select(&table_sel).collect();
    let candidates: &[ElementRef] = match (rule.last_table_only, tables.split_last()) {
        (_, None) => {
            return Err(CollectError::StructureNotRecognized(format!(
                "no element matches '{}'",
                rule.table_selector
            )));
        }
        (true, Some((last, _))) => std::slice::from_ref(last),
        (false, Some(_)) => &tables,
    };

    let mut unparsable: Option<String> = None;

    for table in candidates {
        let rows: Vec<Vec<String>> = table
            .select(&row_sel)
            .map(|tr| {
                tr.select(&cell_sel)
                    .map(|c| c.text().collect::<String>().trim().to_string())
                    .collect()
            })
            .collect();

        let (columns, body) = match rule.column {
            RateColumn::Index(ix) => (ix.to_vec(), &rows[..]),
            RateColumn::Header(names) => {
                let Some((header, body)) = rows.split_first() else {
                    continue;
                };
                match header_index(header, names) {
                    Some(i) => (vec![i], body),
                    None => continue,
                }
            }
        };

        for cells in body {
            if cells.len() < rule.min_cells || !rule.row.matches(cells) {
                continue;
            }
            for &i in &columns {
                let Some(text) = cells.get(i) else { continue };
                match parse_rate(text) {
                    Some(v) => return Ok(v),
                    None => unparsable = Some(text.clone()),
                }
            }
        }
    }

    match unparsable {
        Some(text) => Err(CollectError::ValueUnparsable(text)),
        None => Err(CollectError::StructureNotRecognized(format!(
            "no USD row with a rate column under '{}'",
            rule.table_selector
        ))),
    }
}

fn header_index(header: &[String], names: &[&str]) -> Option<usize> {
    let squash = |s: &str| -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
    };
    let wanted: Vec<String> = names.iter().map(|&n| squash(n)).collect();

    header
        .iter()
        .position(|h| {
            let h = squash(h.as_str());
            wanted.iter().any(|w| h.contains(w.as_str()))
        })
}

fn selector(css: &str) -> Result<Selector, CollectError> {
    Selector::parse(css)
        .map_err(|e| CollectError::StructureNotRecognized(format!("bad selector '{css}': {e}")))
}

// ------------------------------------------------------------
// Static page (stateless)
// ------------------------------------------------------------
pub struct HtmlTableCollector {
    pub bank: &'static str,
    pub rule: TableRule,
}

#[async_trait::async_trait]
impl RateCollector for HtmlTableCollector {
    fn bank_name(&self) -> &'static str {
        self.bank
    }

    fn flavor(&self) -> Flavor {
        Flavor::Stateless
    }

    async fn collect(&self, ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
        let body = ctx
            .http
            .get(ctx.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        extract_rate(&body, &self.rule)
    }
}

// ------------------------------------------------------------
// JavaScript-rendered page (stateful)
// ------------------------------------------------------------
pub struct RenderedTableCollector {
    pub bank: &'static str,
    pub ready_selector: &'static str,
    pub settle: Duration,
    pub rule: TableRule,
}

#[async_trait::async_trait]
impl RateCollector for RenderedTableCollector {
    fn bank_name(&self) -> &'static str {
        self.bank
    }

    fn flavor(&self) -> Flavor {
        Flavor::Stateful
    }

    async fn collect(&self, mut ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
        let url = ctx.endpoint;
        let page = ctx
            .session()?
            .render(RenderRequest {
                url,
                ready_selector: self.ready_selector,
                settle: self.settle,
            })
            .await?;

        extract_rate(&page, &self.rule)
    }
}
