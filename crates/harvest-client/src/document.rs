//! CSS-selector queries over a fetched page.
//!
//! [`Document`] is not `Send`. Parse and extract synchronously after the
//! fetch, and never hold a document across an `.await`.

use harvest_core::error::AppError;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// A parsed HTML page together with the URL it was fetched from.
pub struct Document {
    html: Html,
    url: Url,
}

impl Document {
    pub fn parse(html: &str, url: Url) -> Self {
        Self {
            html: Html::parse_document(html),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Elements matching `selector`. At least one must match.
    pub fn find(&self, selector: &str) -> Result<Selection<'_>, AppError> {
        self.find_optional(selector)?.ok_or_else(|| {
            AppError::ExtractionError(format!("no element matches '{selector}' on {}", self.url))
        })
    }

    /// Elements matching `selector`, or `None` when nothing matches.
    pub fn find_optional(&self, selector: &str) -> Result<Option<Selection<'_>>, AppError> {
        let parsed = parse_selector(selector)?;
        let elements: Vec<_> = self.html.select(&parsed).collect();
        if elements.is_empty() {
            return Ok(None);
        }
        Ok(Some(Selection {
            elements,
            url: &self.url,
        }))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ExtractionError(format!("invalid selector '{selector}': {e}")))
}

/// A non-empty set of matched elements, in document order.
pub struct Selection<'a> {
    elements: Vec<ElementRef<'a>>,
    url: &'a Url,
}

impl<'a> Selection<'a> {
    pub fn first(&self) -> Node<'a> {
        // Only built from a non-empty match list.
        Node {
            element: self.elements[0],
            url: self.url,
        }
    }

    pub fn nth(&self, index: usize) -> Option<Node<'a>> {
        self.elements.get(index).map(|element| Node {
            element: *element,
            url: self.url,
        })
    }

    pub fn all(&self) -> Vec<Node<'a>> {
        self.elements
            .iter()
            .map(|element| Node {
                element: *element,
                url: self.url,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Text of the first match.
    pub fn text(&self) -> String {
        self.first().text()
    }

    /// Absolute `href` of the first match.
    pub fn link(&self) -> Result<Url, AppError> {
        self.first().link()
    }
}

/// One matched element.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    element: ElementRef<'a>,
    url: &'a Url,
}

impl<'a> Node<'a> {
    /// Text content, whitespace-trimmed.
    pub fn text(&self) -> String {
        self.element.text().collect::<String>().trim().to_string()
    }

    pub fn attr(&self, name: &str) -> Result<&'a str, AppError> {
        self.element.value().attr(name).ok_or_else(|| {
            AppError::ExtractionError(format!(
                "<{}> has no '{name}' attribute on {}",
                self.element.value().name(),
                self.url
            ))
        })
    }

    pub fn classes(&self) -> Vec<&'a str> {
        self.element.value().classes().collect()
    }

    /// `href`, resolved against the page URL.
    pub fn link(&self) -> Result<Url, AppError> {
        self.resolve("href")
    }

    /// `src`, resolved against the page URL.
    pub fn image(&self) -> Result<Url, AppError> {
        self.resolve("src")
    }

    /// First descendant matching `selector`.
    pub fn find(&self, selector: &str) -> Result<Node<'a>, AppError> {
        let parsed = parse_selector(selector)?;
        let element = self.element.select(&parsed).next().ok_or_else(|| {
            AppError::ExtractionError(format!("no element matches '{selector}' inside <{}>", self.element.value().name()))
        })?;
        Ok(Node {
            element,
            url: self.url,
        })
    }

    fn resolve(&self, attr: &str) -> Result<Url, AppError> {
        let value = self.attr(attr)?;
        self.url
            .join(value)
            .map_err(|e| AppError::ExtractionError(format!("bad {attr} '{value}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <ul class="nav">
            <li><a href="one.html"> One </a></li>
            <li><a href="../two.html">Two</a></li>
            <li><span>no link</span></li>
          </ul>
          <img src="/media/cover.jpg">
        </body></html>
    "#;

    fn doc() -> Document {
        Document::parse(PAGE, Url::parse("https://example.com/catalogue/page-1.html").unwrap())
    }

    #[test]
    fn find_resolves_links_against_page_url() {
        let doc = doc();
        let links: Vec<String> = doc
            .find("ul.nav a")
            .unwrap()
            .all()
            .iter()
            .map(|n| n.link().unwrap().to_string())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/catalogue/one.html",
                "https://example.com/two.html"
            ]
        );
        assert_eq!(
            doc.find("img").unwrap().first().image().unwrap().as_str(),
            "https://example.com/media/cover.jpg"
        );
    }

    #[test]
    fn text_is_trimmed() {
        assert_eq!(doc().find("ul.nav a").unwrap().text(), "One");
    }

    #[test]
    fn required_and_optional_lookups() {
        let doc = doc();
        let err = doc.find("table").err().unwrap();
        assert!(matches!(err, AppError::ExtractionError(_)));
        assert!(doc.find_optional("table").unwrap().is_none());
        assert!(doc.find_optional("li").unwrap().is_some());
    }

    #[test]
    fn missing_attribute_and_bad_selector_are_errors() {
        let doc = doc();
        let span = doc.find("span").unwrap().first();
        assert!(span.link().is_err());
        assert!(doc.find("li[").is_err());
    }

    #[test]
    fn nested_find_and_nth() {
        let doc = doc();
        let items = doc.find("ul.nav li").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items.nth(1).unwrap().find("a").unwrap().text(), "Two");
        assert!(items.nth(3).is_none());
        assert!(items.nth(2).unwrap().find("a").is_err());
    }
}
