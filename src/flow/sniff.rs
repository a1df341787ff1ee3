//! Hostname sniffing from the first client payload of a TCP flow: the SNI
//! of a TLS ClientHello or the Host header of a plaintext HTTP request.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SniffOutcome {
    Found(String),
    /// The payload looks like a sniffable protocol but is still incomplete.
    NeedMore,
    /// Not a protocol that carries a hostname; stop waiting.
    NotApplicable,
}

const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

pub(super) fn sniff_host(payload: &[u8]) -> SniffOutcome {
    if payload.is_empty() {
        return SniffOutcome::NeedMore;
    }
    if payload[0] == 0x16 {
        return sniff_tls_sni(payload);
    }
    sniff_http_host(payload)
}

/// Walk a TLS ClientHello looking for the server_name extension.
fn sniff_tls_sni(payload: &[u8]) -> SniffOutcome {
    if payload.len() < 5 {
        return SniffOutcome::NeedMore;
    }
    if payload[1] != 0x03 {
        return SniffOutcome::NotApplicable;
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if payload.len() < 5 + record_len {
        return SniffOutcome::NeedMore;
    }
    let hs = &payload[5..5 + record_len];
    if hs.len() < 4 || hs[0] != 0x01 {
        return SniffOutcome::NotApplicable;
    }
    let mut pos = 4usize; // handshake type + 24-bit length
    // client version + random
    pos += 2 + 32;
    // session id
    let Some(&session_len) = hs.get(pos) else {
        return SniffOutcome::NotApplicable;
    };
    pos += 1 + session_len as usize;
    // cipher suites
    if pos + 2 > hs.len() {
        return SniffOutcome::NotApplicable;
    }
    let ciphers_len = u16::from_be_bytes([hs[pos], hs[pos + 1]]) as usize;
    pos += 2 + ciphers_len;
    // compression methods
    let Some(&compression_len) = hs.get(pos) else {
        return SniffOutcome::NotApplicable;
    };
    pos += 1 + compression_len as usize;
    // extensions
    if pos + 2 > hs.len() {
        return SniffOutcome::NotApplicable;
    }
    let extensions_len = u16::from_be_bytes([hs[pos], hs[pos + 1]]) as usize;
    pos += 2;
    let end = (pos + extensions_len).min(hs.len());
    while pos + 4 <= end {
        let ext_type = u16::from_be_bytes([hs[pos], hs[pos + 1]]);
        let ext_len = u16::from_be_bytes([hs[pos + 2], hs[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > end {
            return SniffOutcome::NotApplicable;
        }
        if ext_type == 0 {
            return parse_server_name(&hs[pos..pos + ext_len]);
        }
        pos += ext_len;
    }
    SniffOutcome::NotApplicable
}

fn parse_server_name(extension: &[u8]) -> SniffOutcome {
    if extension.len() < 5 {
        return SniffOutcome::NotApplicable;
    }
    // list length (2), entry type (1, 0 = host_name), name length (2)
    if extension[2] != 0 {
        return SniffOutcome::NotApplicable;
    }
    let name_len = u16::from_be_bytes([extension[3], extension[4]]) as usize;
    if 5 + name_len > extension.len() {
        return SniffOutcome::NotApplicable;
    }
    match std::str::from_utf8(&extension[5..5 + name_len]) {
        Ok(name) if !name.is_empty() => SniffOutcome::Found(name.to_ascii_lowercase()),
        _ => SniffOutcome::NotApplicable,
    }
}

/// Scan request headers for `Host:`. Header names are case-insensitive.
fn sniff_http_host(payload: &[u8]) -> SniffOutcome {
    let looks_like_http = HTTP_METHODS.iter().any(|method| {
        let probe = method.as_bytes();
        let shared = probe.len().min(payload.len());
        payload[..shared] == probe[..shared]
    });
    if !looks_like_http {
        return SniffOutcome::NotApplicable;
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        return SniffOutcome::NotApplicable;
    };
    let headers_complete = text.contains("\r\n\r\n");
    let mut lines = text.split("\r\n");
    let _request_line = lines.next();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("host") {
            let host = strip_port(value.trim());
            if host.is_empty() {
                return SniffOutcome::NotApplicable;
            }
            return SniffOutcome::Found(host.to_ascii_lowercase());
        }
    }
    if headers_complete {
        // Full header block without a Host header.
        SniffOutcome::NotApplicable
    } else {
        SniffOutcome::NeedMore
    }
}

fn strip_port(value: &str) -> &str {
    if let Some(rest) = value.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return rest.split(']').next().unwrap_or("");
    }
    value.split(':').next().unwrap_or("")
}

#[cfg(test)]
pub(super) fn build_client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut server_name = Vec::new();
    server_name.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    server_name.push(0); // host_name
    server_name.extend_from_slice(&(name.len() as u16).to_be_bytes());
    server_name.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name extension
    extensions.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // compression methods
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    let body_len = body.len() as u32;
    handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
