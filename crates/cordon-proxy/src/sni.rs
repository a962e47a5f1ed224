//! Minimal TLS ClientHello parsing: just enough to pull out the SNI.
//!
//! The transparent TLS handler peeks the first bytes of a redirected flow
//! and needs the `server_name` extension value, nothing more. The parser
//! walks the record with bounds-checked slicing; any underflow or
//! unexpected byte means the host is unidentifiable, never a panic.

/// Outcome of scanning a peeked prefix for an SNI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniScan {
    /// A complete ClientHello with a host_name server name.
    Found(String),
    /// A complete ClientHello without an SNI extension (or with a
    /// non-hostname entry only).
    Absent,
    /// The prefix is a plausible ClientHello but more bytes are needed.
    NeedMoreData,
    /// The prefix is not a TLS handshake ClientHello at all.
    NotClientHello,
}

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOST_NAME: u8 = 0x00;

/// Scan a peeked byte prefix for the ClientHello `server_name` value.
#[must_use]
pub fn scan_client_hello(buf: &[u8]) -> SniScan {
    // TLS record header: type(1) version(2) length(2)
    if buf.len() < 5 {
        return if buf.is_empty() || buf[0] == CONTENT_TYPE_HANDSHAKE {
            SniScan::NeedMoreData
        } else {
            SniScan::NotClientHello
        };
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return SniScan::NotClientHello;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let record = match buf.get(5..5 + record_len) {
        Some(r) => r,
        None => return SniScan::NeedMoreData,
    };

    parse_handshake(record)
}

fn parse_handshake(record: &[u8]) -> SniScan {
    let mut cur = Cursor::new(record);

    // Handshake header: type(1) length(3)
    let Some(hs_type) = cur.u8() else {
        return SniScan::NotClientHello;
    };
    if hs_type != HANDSHAKE_CLIENT_HELLO {
        return SniScan::NotClientHello;
    }
    let Some(body_len) = cur.u24() else {
        return SniScan::NotClientHello;
    };
    // The ClientHello may span multiple records; we only handle the common
    // single-record case and treat the rest as unidentifiable.
    let Some(body) = cur.take(body_len) else {
        return SniScan::NotClientHello;
    };

    let mut cur = Cursor::new(body);

    // client_version(2) random(32)
    if cur.take(2 + 32).is_none() {
        return SniScan::NotClientHello;
    }
    // session_id
    let Some(sid_len) = cur.u8() else {
        return SniScan::NotClientHello;
    };
    if cur.take(sid_len as usize).is_none() {
        return SniScan::NotClientHello;
    }
    // cipher_suites
    let Some(cs_len) = cur.u16() else {
        return SniScan::NotClientHello;
    };
    if cur.take(cs_len as usize).is_none() {
        return SniScan::NotClientHello;
    }
    // compression_methods
    let Some(cm_len) = cur.u8() else {
        return SniScan::NotClientHello;
    };
    if cur.take(cm_len as usize).is_none() {
        return SniScan::NotClientHello;
    }

    // Extensions are optional (SSLv3-era hellos).
    let Some(ext_total) = cur.u16() else {
        return SniScan::Absent;
    };
    let Some(exts) = cur.take(ext_total as usize) else {
        return SniScan::NotClientHello;
    };

    let mut cur = Cursor::new(exts);
    while let (Some(ext_type), Some(ext_len)) = (cur.u16(), cur.u16()) {
        let Some(ext_data) = cur.take(ext_len as usize) else {
            return SniScan::NotClientHello;
        };
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_list(ext_data);
        }
    }

    SniScan::Absent
}

fn parse_server_name_list(data: &[u8]) -> SniScan {
    let mut cur = Cursor::new(data);
    let Some(list_len) = cur.u16() else {
        return SniScan::Absent;
    };
    let Some(list) = cur.take(list_len as usize) else {
        return SniScan::NotClientHello;
    };

    let mut cur = Cursor::new(list);
    while let Some(name_type) = cur.u8() {
        let Some(name_len) = cur.u16() else {
            return SniScan::NotClientHello;
        };
        let Some(name) = cur.take(name_len as usize) else {
            return SniScan::NotClientHello;
        };
        if name_type == SNI_TYPE_HOST_NAME {
            return match std::str::from_utf8(name) {
                Ok(s) if !s.is_empty() => SniScan::Found(s.to_string()),
                _ => SniScan::Absent,
            };
        }
    }

    SniScan::Absent
}

/// Bounds-checked forward reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}
