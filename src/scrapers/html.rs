use crate::scrapers::types::ImageAttrs;
use scraper::{ElementRef, Selector};

/// Parse a selector that is known at compile time
pub fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css:?}: {e:?}"))
}

/// Element text with whitespace collapsed, or `None` when blank
pub fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Text of the first descendant matching `selector`
pub fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).find_map(text_of)
}

/// Image attributes of the first `<img>` under `element`
pub fn image_attrs(element: ElementRef<'_>, img: &Selector) -> ImageAttrs {
    element
        .select(img)
        .next()
        .map(|img| {
            let attr = |name: &str| img.value().attr(name).map(str::to_string);
            ImageAttrs {
                data_src: attr("data-src"),
                srcset: attr("srcset"),
                src: attr("src"),
            }
        })
        .unwrap_or_default()
}
