//! Rates published as a PDF linked from a landing page.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use reqwest::header::{ACCEPT, REFERER};
use rust_decimal::Decimal;
use scraper::{Html, Selector};

use crate::collector::{CollectContext, Flavor, RateCollector};
use crate::error::CollectError;
use crate::util::parse_rate;

/// USD row of the SBI card-rate sheet; the first number is TT buy.
pub static SBI_USD_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)UNITED STATES DOLLAR\s+USD/INR\s+([0-9.,]+)").expect("static regex")
});

pub struct PdfRateCollector {
    pub bank: &'static str,
    /// Case-insensitive anchor text of the PDF link on the landing page
    pub link_text: &'static str,
    /// Capture group 1 holds the rate
    pub pattern: &'static Lazy<Regex>,
}

#[async_trait::async_trait]
impl RateCollector for PdfRateCollector {
    fn bank_name(&self) -> &'static str {
        self.bank
    }

    fn flavor(&self) -> Flavor {
        Flavor::Stateless
    }

    async fn collect(&self, ctx: CollectContext<'_>) -> Result<Decimal, CollectError> {
        let landing = ctx
            .http
            .get(ctx.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let pdf_url = find_link(&landing, ctx.endpoint, self.link_text)?;
        debug!("[{}] rate sheet at {pdf_url}", ctx.source_id);

        let bytes = ctx
            .http
            .get(pdf_url)
            .header(ACCEPT, "application/pdf")
            .header(REFERER, ctx.endpoint)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if bytes.is_empty() {
            return Err(CollectError::StructureNotRecognized("empty PDF".into()));
        }

        // extraction is CPU-bound and may panic on malformed input
        let text = tokio::task::spawn_blocking(move || extract_pdf_text(&bytes))
            .await
            .map_err(|e| {
                CollectError::StructureNotRecognized(format!("PDF extraction aborted: {e}"))
            })??;
        match_rate(&text, self.pattern)
    }
}

/// Resolves the first `<a href>` whose text contains `link_text`.
pub fn find_link(html: &str, base: &str, link_text: &str) -> Result<Url, CollectError> {
    let doc = Html::parse_document(html);
    let anchors = Selector::parse("a[href]")
        .map_err(|e| CollectError::StructureNotRecognized(format!("bad selector: {e}")))?;
    let needle = link_text.to_uppercase();

    let href = doc
        .select(&anchors)
        .find(|a| a.text().collect::<String>().to_uppercase().contains(&needle))
        .and_then(|a| a.value().attr("href"))
        .ok_or_else(|| CollectError::StructureNotRecognized(format!("no '{link_text}' link")))?;

    Url::parse(base)
        .and_then(|b| b.join(href))
        .map_err(|e| CollectError::StructureNotRecognized(format!("bad link {href:?}: {e}")))
}

pub fn match_rate(text: &str, pattern: &Regex) -> Result<Decimal, CollectError> {
    let caps = pattern.captures(text).ok_or_else(|| {
        CollectError::StructureNotRecognized(format!("pattern {} not found", pattern.as_str()))
    })?;
    let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    parse_rate(raw).ok_or_else(|| CollectError::ValueUnparsable(raw.to_string()))
}

/// Text of every page, in reading order.
///
/// Font encodings and `ToUnicode` maps are honoured, so subset
/// TrueType and CID fonts come out as real characters.
pub fn extract_pdf_text(pdf: &[u8]) -> Result<String, CollectError> {
    pdf_extract::extract_text_from_mem(pdf)
        .map_err(|e| CollectError::StructureNotRecognized(format!("unreadable PDF: {e}")))
}
