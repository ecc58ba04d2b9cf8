//! Hostname extraction from cleartext handshake bytes.
//!
//! Both extractors are pure and total: any payload, including truncated or
//! hostile input, yields either a hostname or `None`. A `None` from a
//! truncated payload means "not classifiable yet", not an error.

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

const RANDOM_LEN: usize = 32;

/// Returns the value of the first `Host:` header line, trimmed.
pub fn extract_http_host(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);

    for line in text.split("\r\n") {
        let Some(name) = line.get(..5) else {
            continue;
        };
        if !name.eq_ignore_ascii_case("host:") {
            continue;
        }
        let host = line[5..].trim();
        if host.is_empty() {
            return None;
        }
        return Some(host.to_string());
    }

    None
}

/// Returns the `host_name` carried in the server_name extension of a TLS
/// ClientHello, if the whole record is present.
pub fn extract_tls_sni(payload: &[u8]) -> Option<String> {
    let mut record = Reader::new(payload);
    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    record.skip(2)?; // legacy record version
    let record_len = record.u16()? as usize;
    let handshake = record.bytes(record_len)?;

    let mut hs = Reader::new(handshake);
    if hs.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    hs.skip(3)?; // handshake body length
    hs.skip(2)?; // client version
    hs.skip(RANDOM_LEN)?;

    let session_id_len = hs.u8()? as usize;
    hs.skip(session_id_len)?;
    let cipher_suites_len = hs.u16()? as usize;
    hs.skip(cipher_suites_len)?;
    let compression_len = hs.u8()? as usize;
    hs.skip(compression_len)?;

    let extensions_len = hs.u16()? as usize;
    let mut extensions = Reader::new(hs.bytes(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let body = extensions.bytes(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return server_name(body);
        }
    }

    None
}

fn server_name(body: &[u8]) -> Option<String> {
    let mut ext = Reader::new(body);
    let list_len = ext.u16()? as usize;
    let mut list = Reader::new(ext.bytes(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.bytes(name_len)?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }
        if name.is_empty() {
            return None;
        }
        // Invalid bytes become U+FFFD, so such a name is classified (and
        // never matches an allowed domain) instead of waiting out the grace period.
        return Some(String::from_utf8_lossy(name).into_owned());
    }

    None
}

/// Bounds-checked big-endian cursor. Every read returns `None` instead of
/// indexing past the end.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}
