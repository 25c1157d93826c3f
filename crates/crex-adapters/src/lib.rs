//! Site adapter contract + per-vendor listing extractors.
//!
//! Adapters are thin I/O wrappers: fetch the configured listing pages and
//! turn their DOM into [`RawListing`] field bags. Everything downstream of
//! that (normalization, diffing, persistence) is vendor-independent.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use crex_core::RawListing;
use crex_storage::{FetchError, FetchedPage, PageFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "crex-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;

    /// Fetch every configured listing page for this source. The default
    /// implementation GETs each URL in order through the shared fetcher.
    async fn fetch_pages(
        &self,
        http: &PageFetcher,
        listing_urls: &[String],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(listing_urls.len());
        for url in listing_urls {
            pages.push(http.fetch_page(self.source_id(), url).await?);
        }
        Ok(pages)
    }

    /// Extract raw listing records from one fetched page.
    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "cbre" => Some(Box::new(CbreAdapter)),
        "landpark" => Some(Box::new(LandparkAdapter)),
        "lee" => Some(Box::new(LeeAdapter)),
        "sample-source" => Some(Box::new(CardGridAdapter {
            source_id: "sample-source",
            display_name: "Sample Source",
        })),
        _ => None,
    }
}

/// Read an offline fixture page for sources running in fixture mode.
pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<String, AdapterError> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map_err(|err| AdapterError::Message(format!("reading fixture {}: {err}", path.display())))
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Resolve a possibly host-relative href against the page it came from.
fn absolutize(page_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let origin = match page_url.find("://") {
        Some(scheme_end) => match page_url[scheme_end + 3..].find('/') {
            Some(path_start) => &page_url[..scheme_end + 3 + path_start],
            None => page_url,
        },
        None => page_url,
    };
    if href.starts_with('/') {
        format!("{origin}{href}")
    } else {
        format!("{origin}/{href}")
    }
}

/// CBRE search result grid.
#[derive(Debug, Clone, Copy)]
pub struct CbreAdapter;

#[async_trait]
impl SourceAdapter for CbreAdapter {
    fn source_id(&self) -> &'static str {
        "cbre"
    }

    fn display_name(&self) -> &'static str {
        "CBRE Properties"
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = parse_selector(".cbre-c-pl-propertyCard")?;
        let name_sel = parse_selector(".cbre-c-pl-propertyCard__address-heading")?;
        let address_sel = parse_selector(".cbre-c-pl-propertyCard__address-subheading")?;
        let suite_sel = parse_selector(".cbre-c-pl-propertyCard__suite")?;
        let space_sel = parse_selector(".cbre-c-pl-propertyCard__availableArea")?;
        let price_sel = parse_selector(".cbre-c-pl-propertyCard__price")?;
        let link_sel = parse_selector("a.cbre-c-pl-propertyCard__link")?;

        Ok(document
            .select(&card_sel)
            .map(|card| RawListing {
                property_name: first_text(&card, &name_sel),
                address: first_text(&card, &address_sel),
                floor_suite: first_text(&card, &suite_sel),
                space_available: first_text(&card, &space_sel),
                price: first_text(&card, &price_sel),
                listing_url: first_attr(&card, &link_sel, "href")
                    .map(|href| absolutize(page_url, &href)),
            })
            .collect())
    }
}

/// LandPark's buildout-style property grid.
#[derive(Debug, Clone, Copy)]
pub struct LandparkAdapter;

#[async_trait]
impl SourceAdapter for LandparkAdapter {
    fn source_id(&self) -> &'static str {
        "landpark"
    }

    fn display_name(&self) -> &'static str {
        "LandPark Properties"
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = parse_selector(".property-card")?;
        let name_sel = parse_selector(".js-property-title")?;
        let address_sel = parse_selector(".js-property-address")?;
        let space_sel = parse_selector(".js-sqft")?;
        let price_sel = parse_selector(".js-price")?;
        let link_sel = parse_selector("a.js-property-link")?;

        Ok(document
            .select(&card_sel)
            .map(|card| RawListing {
                property_name: first_text(&card, &name_sel),
                address: first_text(&card, &address_sel),
                floor_suite: None,
                space_available: first_text(&card, &space_sel),
                price: first_text(&card, &price_sel),
                listing_url: first_attr(&card, &link_sel, "href")
                    .map(|href| absolutize(page_url, &href)),
            })
            .collect())
    }
}

/// Lee & Associates property detail page: one header block plus one row
/// per leasable space. Each space row becomes its own listing record
/// sharing the page's name and address. The page URL is deliberately left
/// off per-space records: it is identical for every suite of a building,
/// and identity must come from the (property_name, floor_suite) pair so
/// the suites stay distinct downstream.
#[derive(Debug, Clone, Copy)]
pub struct LeeAdapter;

#[async_trait]
impl SourceAdapter for LeeAdapter {
    fn source_id(&self) -> &'static str {
        "lee"
    }

    fn display_name(&self) -> &'static str {
        "Lee & Associates Properties"
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let name_sel = parse_selector(".pdt-header1 h1")?;
        let address_sel = parse_selector(".pdt-header2 h2")?;
        let row_sel = parse_selector(".js-lease-space-row-toggle.spaces")?;
        let suite_sel = parse_selector(".js-space-name")?;
        let space_sel = parse_selector(".js-space-sqft")?;
        let price_sel = parse_selector(".js-space-price")?;

        let property_name = first_text(&root, &name_sel);
        let address = first_text(&root, &address_sel);

        let rows: Vec<RawListing> = root
            .select(&row_sel)
            .map(|row| RawListing {
                property_name: property_name.clone(),
                address: address.clone(),
                floor_suite: first_text(&row, &suite_sel),
                space_available: first_text(&row, &space_sel),
                price: first_text(&row, &price_sel),
                listing_url: None,
            })
            .collect();

        if rows.is_empty() && (property_name.is_some() || address.is_some()) {
            return Ok(vec![RawListing {
                property_name,
                address,
                floor_suite: None,
                space_available: None,
                price: None,
                listing_url: Some(page_url.to_string()),
            }]);
        }

        Ok(rows)
    }
}

/// Generic card-grid extractor used for fixture-mode sources.
#[derive(Debug, Clone, Copy)]
pub struct CardGridAdapter {
    pub source_id: &'static str,
    pub display_name: &'static str,
}

#[async_trait]
impl SourceAdapter for CardGridAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let card_sel = parse_selector(".listing-card")?;
        let name_sel = parse_selector(".name")?;
        let address_sel = parse_selector(".address")?;
        let suite_sel = parse_selector(".suite")?;
        let space_sel = parse_selector(".space")?;
        let price_sel = parse_selector(".price")?;
        let link_sel = parse_selector("a[href]")?;

        Ok(document
            .select(&card_sel)
            .map(|card| RawListing {
                property_name: first_text(&card, &name_sel),
                address: first_text(&card, &address_sel),
                floor_suite: first_text(&card, &suite_sel),
                space_available: first_text(&card, &space_sel),
                price: first_text(&card, &price_sel),
                listing_url: first_attr(&card, &link_sel, "href")
                    .map(|href| absolutize(page_url, &href)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbre_parses_property_cards() {
        let html = r#"
            <div class="cbre-c-pl-propertyCard">
                <a class="cbre-c-pl-propertyCard__link" href="/properties/monarch-tower"></a>
                <h3 class="cbre-c-pl-propertyCard__address-heading">Monarch Tower</h3>
                <p class="cbre-c-pl-propertyCard__address-subheading">3424 Peachtree Rd, Atlanta GA</p>
                <span class="cbre-c-pl-propertyCard__suite">Suite 400</span>
                <span class="cbre-c-pl-propertyCard__availableArea">12,000 SF</span>
                <span class="cbre-c-pl-propertyCard__price">$32/sqft</span>
            </div>
            <div class="cbre-c-pl-propertyCard">
                <h3 class="cbre-c-pl-propertyCard__address-heading">Second Building</h3>
            </div>
        "#;
        let listings = CbreAdapter
            .parse_page("https://www.cbre.com/properties", html)
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].property_name.as_deref(), Some("Monarch Tower"));
        assert_eq!(
            listings[0].listing_url.as_deref(),
            Some("https://www.cbre.com/properties/monarch-tower")
        );
        assert_eq!(listings[0].price.as_deref(), Some("$32/sqft"));
        assert_eq!(listings[1].listing_url, None);
        assert_eq!(listings[1].price, None);
    }

    #[test]
    fn lee_emits_one_record_per_space_row() {
        let html = r#"
            <div class="pdt-header1"><h1>Perimeter Center</h1></div>
            <div class="pdt-header2"><h2>123 Perimeter Ctr, Dunwoody GA</h2></div>
            <table>
                <tr class="js-lease-space-row-toggle spaces">
                    <td class="js-space-name">Suite 100</td>
                    <td class="js-space-sqft">4,500 SF</td>
                    <td class="js-space-price">$28/sqft</td>
                </tr>
                <tr class="js-lease-space-row-toggle spaces">
                    <td class="js-space-name">Suite 210</td>
                    <td class="js-space-sqft">2,100 SF</td>
                    <td class="js-space-price">Contact for pricing</td>
                </tr>
            </table>
        "#;
        let listings = LeeAdapter
            .parse_page("https://www.lee-associates.com/p/1", html)
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(
            listings[0].property_name.as_deref(),
            Some("Perimeter Center")
        );
        assert_eq!(listings[0].floor_suite.as_deref(), Some("Suite 100"));
        assert_eq!(listings[1].price.as_deref(), Some("Contact for pricing"));
        // Space rows carry no URL so each suite keys on name + suite.
        assert_eq!(listings[0].listing_url, None);
        assert_eq!(listings[1].listing_url, None);
    }

    #[test]
    fn lee_space_rows_keep_distinct_canonical_keys() {
        let html = r#"
            <div class="pdt-header1"><h1>Perimeter Center</h1></div>
            <div class="pdt-header2"><h2>123 Perimeter Ctr, Dunwoody GA</h2></div>
            <table>
                <tr class="js-lease-space-row-toggle spaces">
                    <td class="js-space-name">Suite 100</td>
                    <td class="js-space-price">$28/sqft</td>
                </tr>
                <tr class="js-lease-space-row-toggle spaces">
                    <td class="js-space-name">Suite 210</td>
                    <td class="js-space-price">$30/sqft</td>
                </tr>
            </table>
        "#;
        let raws = LeeAdapter
            .parse_page("https://www.lee-associates.com/p/1", html)
            .unwrap();
        assert_eq!(raws.len(), 2);

        let now = chrono::Utc::now();
        let keys: Vec<_> = raws
            .into_iter()
            .map(|raw| crex_core::normalize(raw, "lee", now).unwrap().key())
            .collect();
        assert_ne!(keys[0], keys[1]);
    }

    #[test]
    fn lee_falls_back_to_header_only_record() {
        let html = r#"
            <div class="pdt-header1"><h1>Empty Building</h1></div>
            <div class="pdt-header2"><h2>1 Main St</h2></div>
        "#;
        let listings = LeeAdapter
            .parse_page("https://www.lee-associates.com/p/2", html)
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].floor_suite, None);
    }

    #[test]
    fn landpark_parses_buildout_cards() {
        let html = r#"
            <div class="property-card">
                <a class="js-property-link" href="https://properties.landparkco.com/p/9"></a>
                <div class="js-property-title">Riverside Plaza</div>
                <div class="js-property-address">500 River Rd</div>
                <div class="js-sqft">8,800 SF</div>
                <div class="js-price">$18/sqft</div>
            </div>
        "#;
        let listings = LandparkAdapter
            .parse_page("https://properties.landparkco.com/", html)
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].property_name.as_deref(), Some("Riverside Plaza"));
        assert_eq!(
            listings[0].listing_url.as_deref(),
            Some("https://properties.landparkco.com/p/9")
        );
    }

    #[test]
    fn absolutize_handles_relative_and_absolute_hrefs() {
        assert_eq!(
            absolutize("https://a.example/path/page", "/p/1"),
            "https://a.example/p/1"
        );
        assert_eq!(
            absolutize("https://a.example", "p/1"),
            "https://a.example/p/1"
        );
        assert_eq!(absolutize("https://a.example", "https://b.example/x"), "https://b.example/x");
    }

    #[test]
    fn unknown_source_has_no_adapter() {
        assert!(adapter_for_source("trinity").is_none());
        assert!(adapter_for_source("cbre").is_some());
    }
}
