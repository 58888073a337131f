//! Portal redirect answers.

use std::net::Ipv4Addr;

use crate::dns::{Message, Record};

/// TTL on synthesized answers. Zero keeps clients from caching the portal
/// address past the moment they authenticate.
pub const REDIRECT_TTL: u32 = 0;

/// Build the answer sent to an unauthorized client.
///
/// The result is a copy of `query` with the response flag set and a single
/// A record pointing the first question's name at `portal`. Returns `None`
/// for a query without questions.
pub fn redirect(query: &Message, portal: Ipv4Addr) -> Option<Message> {
    let first = query.questions.first()?;

    let mut response = query.clone();
    response.header.response = true;
    response
        .answers
        .push(Record::a(first.name.clone(), portal, REDIRECT_TTL));

    Some(response)
}
