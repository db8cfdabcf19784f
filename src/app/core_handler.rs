use coap_lite::{ContentFormat, ResponseType};

use crate::app::response::{Response, ResponseBuilder};
use crate::codec::{self, Link};

/// Render the `/.well-known/core` listing: one bare `<url>` link per registered URL, in
/// registration order.
pub(crate) fn render(directory: &[String]) -> Response {
    let links: Vec<Link> = directory
        .iter()
        .map(|url| Link {
            path: url.clone(),
            attributes: Vec::new(),
        })
        .collect();

    ResponseBuilder::new()
        .status(ResponseType::Content)
        .content_format(ContentFormat::ApplicationLinkFormat)
        .payload(codec::format_links(&links))
        .finish()
}
