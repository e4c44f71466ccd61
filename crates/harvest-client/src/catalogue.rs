//! Book catalogue crawl (books.toscrape.com layout).
//!
//! Seeding reads the page count from the index page and enqueues one
//! [`LIST_PAGE`] task per listing page. Each listing page fans out into one
//! [`BOOK`] task per product, and each book task records a [`Book`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use harvest_core::error::AppError;
use harvest_core::operation::{Operation, TaskContext};
use harvest_core::task::{Params, Task};
use harvest_core::traits::Fetcher;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::document::Document;

pub const LIST_PAGE: &str = "catalogue.list_page";
pub const BOOK: &str = "catalogue.book";

pub const DEFAULT_BASE_URL: &str = "https://books.toscrape.com/";

/// Where the catalogue lives and how to fetch it. Shared by its operations.
#[derive(Clone)]
pub struct Catalogue<F> {
    fetcher: F,
    base: Url,
}

impl<F: Fetcher> Catalogue<F> {
    pub fn new(fetcher: F, base_url: &str) -> Result<Self, AppError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("invalid base URL '{base_url}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { fetcher, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn join(&self, path: &str) -> Result<Url, AppError> {
        self.base
            .join(path)
            .map_err(|e| AppError::InvalidParams(format!("bad path '{path}': {e}")))
    }

    async fn fetch(&self, url: Url) -> Result<(String, Url), AppError> {
        let html = self.fetcher.fetch(url.as_str()).await?;
        Ok((html, url))
    }

    /// Read the number of listing pages from the index page.
    pub async fn page_count(&self) -> Result<u32, AppError> {
        let (html, url) = self.fetch(self.base.clone()).await?;
        parse_page_count(&Document::parse(&html, url))
    }

    /// One [`LIST_PAGE`] task per listing page.
    pub async fn seed(&self) -> Result<Vec<Task>, AppError> {
        let pages = self.page_count().await?;
        tracing::info!(pages, base = %self.base, "Discovered catalogue pages");
        Ok((1..=pages)
            .map(|page_number| Task::new(LIST_PAGE).with_param("page_number", page_number))
            .collect())
    }
}

/// `catalogue.list_page {page_number}`: enqueue every book on the page.
pub struct ListPage<F> {
    catalogue: Catalogue<F>,
}

impl<F: Fetcher> ListPage<F> {
    pub fn new(catalogue: Catalogue<F>) -> Self {
        Self { catalogue }
    }
}

#[async_trait]
impl<F: Fetcher + 'static> Operation for ListPage<F> {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        let page_number: u32 = params.get("page_number")?;
        let url = self
            .catalogue
            .join(&format!("catalogue/page-{page_number}.html"))?;
        let (html, url) = self.catalogue.fetch(url).await?;
        let links = parse_book_links(&Document::parse(&html, url))?;

        tracing::debug!(page_number, books = links.len(), "Collected book links");
        for link in links {
            ctx.enqueue(Task::new(BOOK).with_param("link", link.to_string()));
        }
        Ok(())
    }
}

/// `catalogue.book {link}`: record the book's details.
pub struct BookPage<F> {
    catalogue: Catalogue<F>,
}

impl<F: Fetcher> BookPage<F> {
    pub fn new(catalogue: Catalogue<F>) -> Self {
        Self { catalogue }
    }
}

#[async_trait]
impl<F: Fetcher + 'static> Operation for BookPage<F> {
    async fn run(&self, ctx: &mut TaskContext, params: &Params) -> Result<(), AppError> {
        let link: String = params.get("link")?;
        let url = self.catalogue.join(&link)?;
        let (html, url) = self.catalogue.fetch(url).await?;
        let book = Book::from_document(&Document::parse(&html, url))?;
        ctx.record(&book)
    }
}

/// One product page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub image_link: String,
    pub title: String,
    pub category: String,
    /// In cents.
    pub price: u64,
    pub available: u32,
    /// 1 to 5 stars.
    pub rating: u8,
    pub description: Option<String>,
    pub product_information: BTreeMap<String, String>,
}

impl Book {
    pub fn from_document(doc: &Document) -> Result<Self, AppError> {
        let image_link = doc.find("img")?.first().image()?.to_string();
        let title = doc.find("h1")?.text();

        // The breadcrumb ends with the book itself; its parent is the category.
        let crumbs = doc.find("ul.breadcrumb li")?;
        let category = crumbs
            .len()
            .checked_sub(2)
            .and_then(|i| crumbs.nth(i))
            .map(|n| n.text())
            .ok_or_else(|| AppError::ExtractionError("breadcrumb has no category".into()))?;

        let price = parse_price_cents(&doc.find(".price_color")?.text())?;
        let available = parse_digits(&doc.find(".instock.availability")?.text())?;
        let rating = parse_rating(&doc.find(".star-rating")?.first().classes())?;
        let description = doc
            .find_optional("#product_description ~ p")?
            .map(|s| s.text());

        let mut product_information = BTreeMap::new();
        if let Some(rows) = doc.find_optional("table.table-striped tr")? {
            for row in rows.all() {
                product_information.insert(row.find("th")?.text(), row.find("td")?.text());
            }
        }

        Ok(Self {
            image_link,
            title,
            category,
            price,
            available,
            rating,
            description,
            product_information,
        })
    }
}

/// "Page 1 of 50" → 50.
pub fn parse_page_count(doc: &Document) -> Result<u32, AppError> {
    let text = doc.find(".current")?.text();
    text.split_whitespace()
        .last()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| AppError::ExtractionError(format!("unexpected pager text '{text}'")))
}

pub fn parse_book_links(doc: &Document) -> Result<Vec<Url>, AppError> {
    doc.find(".image_container a")?
        .all()
        .iter()
        .map(|node| node.link())
        .collect()
}

/// "£51.77" → 5177. Exact, no float.
fn parse_price_cents(text: &str) -> Result<u64, AppError> {
    let invalid = || AppError::ExtractionError(format!("unparsable price '{text}'"));
    let number: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let (whole, fraction) = number.split_once('.').unwrap_or((number.as_str(), ""));
    if whole.is_empty() || fraction.len() > 2 {
        return Err(invalid());
    }
    let whole: u64 = whole.parse().map_err(|_| invalid())?;
    let cents: u64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<u64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };
    whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(cents))
        .ok_or_else(invalid)
}

/// "In stock (22 available)" → 22.
fn parse_digits(text: &str) -> Result<u32, AppError> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits
        .parse()
        .map_err(|_| AppError::ExtractionError(format!("no number in '{text}'")))
}

/// Classes `star-rating Three` → 3.
fn parse_rating(classes: &[&str]) -> Result<u8, AppError> {
    classes
        .iter()
        .find_map(|class| match class.to_ascii_lowercase().as_str() {
            "one" => Some(1),
            "two" => Some(2),
            "three" => Some(3),
            "four" => Some(4),
            "five" => Some(5),
            _ => None,
        })
        .ok_or_else(|| AppError::ExtractionError(format!("no rating word in {classes:?}")))
}
