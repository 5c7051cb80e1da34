//! Access logging in Common Log Format, one line per completed exchange.

use std::net::IpAddr;

use crate::util::{ClfDate, LogEncoded};

/// Emit one CLF record to stdout. Connections that died before producing a
/// status are not logged.
pub fn record(
    peer: IpAddr,
    now: i64,
    method: &str,
    uri: &str,
    status: u16,
    bytes_sent: usize,
    referer: &str,
    user_agent: &str,
) {
    if status == 0 || method.is_empty() {
        return;
    }
    println!(
        "{} - - {} \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"",
        peer,
        ClfDate(now),
        LogEncoded(method),
        LogEncoded(uri),
        status,
        bytes_sent,
        LogEncoded(referer),
        LogEncoded(user_agent),
    );
}
