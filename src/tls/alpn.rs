//! ALPN selection (spec.md §6): "client offers an ordered list; server
//! selects the first protocol from its own ordered list that appears
//! anywhere in the client's offer. If the client wire list is malformed,
//! reject with 'no-ack'."

/// Parses the ALPN wire format (a sequence of length-prefixed byte
/// strings) into an ordered list, or `None` if malformed.
pub fn parse_wire_list(wire: &[u8]) -> Option<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < wire.len() {
        let len = wire[i] as usize;
        i += 1;
        if len == 0 || i + len > wire.len() {
            return None;
        }
        out.push(&wire[i..i + len]);
        i += len;
    }
    Some(out)
}

/// Selects the first protocol in `server_protocols` that appears anywhere
/// in the client's offer; server order wins over client order (spec.md §8
/// boundary example: server=[h2, http/1.1], client=[http/1.1, h2] -> h2).
pub fn select_protocol<'a>(server_protocols: &'a [&'a [u8]], client_wire: &[u8]) -> Option<&'a [u8]> {
    let client = parse_wire_list(client_wire)?;
    server_protocols
        .iter()
        .find(|sp| client.iter().any(|cp| cp == sp))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_order_wins_over_client_order() {
        // spec.md §8 S6: server ["h2","http/1.1"], client wire
        // "\x08http/1.1\x02h2" -> selected "h2".
        let wire = b"\x08http/1.1\x02h2";
        let server: Vec<&[u8]> = vec![b"h2", b"http/1.1"];
        let selected = select_protocol(&server, wire);
        assert_eq!(selected, Some(&b"h2"[..]));
    }

    #[test]
    fn malformed_wire_list_rejected() {
        let wire = b"\xffshort";
        assert!(parse_wire_list(wire).is_none());
        let server: Vec<&[u8]> = vec![b"h2"];
        assert!(select_protocol(&server, wire).is_none());
    }

    #[test]
    fn no_overlap_returns_none() {
        let wire = b"\x02h3";
        let server: Vec<&[u8]> = vec![b"h2", b"http/1.1"];
        assert!(select_protocol(&server, wire).is_none());
    }
}
