//! ADC protocol adaptor.
//!
//! Line-oriented UTF-8 commands: a four-character header (message type plus a
//! three-letter command) followed by space-separated, escaped parameters.
//! Positional parameters come first, then two-letter named fields. The
//! adaptor tracks the hub-assigned SID, the nick/address of every announced
//! user, and the pending password challenge.

use std::collections::HashMap;

use digest::Digest;
use rand::RngCore;
use tiger::Tiger;

use crate::share::SearchQuery;
use crate::tth::Tth;
use crate::types::{ChatMessage, Cid};

use super::search_queue::PendingSearch;
use super::user::Identity;
use super::{PbdParams, ProtocolAdaptor, ProtocolEvent};

/// Escape one ADC parameter
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

/// Unescape one ADC parameter
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('s') => out.push(' '),
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_sid(s: &str) -> Option<u32> {
    // SIDs are four base32 characters.
    if s.len() != 4 {
        return None;
    }
    let mut value = 0u32;
    for c in s.bytes() {
        value = value * 32 + base32_digit(c)? as u32;
    }
    Some(value)
}

fn base32_digit(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'2'..=b'7' => Some(c - b'2' + 26),
        _ => None,
    }
}

fn format_sid(mut value: u32) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = [b'A'; 4];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 32) as usize];
        value /= 32;
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct KnownUser {
    nick: String,
    ip: Option<String>,
    cid: Option<Cid>,
}

/// The ADC dialect
pub struct AdcProtocol {
    /// Our hub-assigned SID
    sid: Option<u32>,
    /// Private id; the CID is its Tiger hash
    pid: [u8; 24],
    /// Our client id
    cid: Cid,
    /// Users seen via BINF, for nick/address resolution
    users: HashMap<u32, KnownUser>,
    /// Last GPA challenge
    challenge: Vec<u8>,
}

impl AdcProtocol {
    /// Create an adaptor with a fresh private id
    pub fn new() -> Self {
        let mut pid = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut pid);
        let cid_bytes: [u8; 24] = Tiger::digest(pid).into();
        Self {
            sid: None,
            pid,
            cid: Cid(cid_bytes),
            users: HashMap::new(),
            challenge: Vec::new(),
        }
    }

    /// Our client id
    pub fn cid(&self) -> Cid {
        self.cid
    }

    fn named_params<'a>(fields: &'a [String]) -> HashMap<&'a str, &'a str> {
        let mut out = HashMap::new();
        for field in fields {
            if field.len() >= 2 {
                out.insert(&field[..2], &field[2..]);
            }
        }
        out
    }

    fn parse_identity(named: &HashMap<&str, &str>, previous: Option<&Identity>) -> Identity {
        let mut identity = previous.cloned().unwrap_or_default();
        if let Some(nick) = named.get("NI") {
            identity.nick = unescape(nick);
        }
        if let Some(cid) = named.get("ID") {
            identity.cid = Cid::from_base32(cid);
        }
        if let Some(desc) = named.get("DE") {
            identity.description = unescape(desc);
        }
        if let Some(share) = named.get("SS") {
            identity.share_size = share.parse().unwrap_or(identity.share_size);
        }
        if let Some(slots) = named.get("SL") {
            identity.slots = slots.parse().unwrap_or(identity.slots);
        }
        if let Some(ip) = named.get("I4") {
            identity.ip = Some((*ip).to_string());
        }
        if let Some(ct) = named.get("CT") {
            let ct: u32 = ct.parse().unwrap_or(0);
            identity.registered = ct & 2 != 0;
            identity.operator = ct & (4 | 8 | 16) != 0;
        }
        if let Some(su) = named.get("SU") {
            identity.mcn = su.split(',').any(|f| f == "MCN1");
        }
        identity
    }

    fn parse_query(named: &HashMap<&str, &str>, fields: &[String]) -> (SearchQuery, String) {
        let mut query = SearchQuery::default();
        for field in fields {
            if let Some(term) = field.strip_prefix("AN") {
                query.include.push(unescape(term));
            } else if let Some(term) = field.strip_prefix("NO") {
                query.exclude.push(unescape(term));
            } else if let Some(ext) = field.strip_prefix("EX") {
                query.extensions.push(unescape(ext).to_lowercase());
            }
        }
        query.tth = named.get("TR").and_then(|t| Tth::from_base32(t));
        query.min_size = named.get("GE").and_then(|v| v.parse().ok());
        query.max_size = named.get("LE").and_then(|v| v.parse().ok());
        if let Some(eq) = named.get("EQ").and_then(|v| v.parse().ok()) {
            query.min_size = Some(eq);
            query.max_size = Some(eq);
        }
        let token = named.get("TO").map(|t| (*t).to_string()).unwrap_or_default();
        (query, token)
    }

    fn flood_key(&self, sid: u32) -> String {
        self.users
            .get(&sid)
            .and_then(|u| u.ip.clone())
            .unwrap_or_else(|| format!("sid:{}", format_sid(sid)))
    }

    fn chat_message(&self, sid: u32, text: String, named: &HashMap<&str, &str>, private: bool) -> ChatMessage {
        ChatMessage {
            from: self
                .users
                .get(&sid)
                .map(|u| u.nick.clone())
                .unwrap_or_else(|| format_sid(sid)),
            text,
            third_person: named.contains_key("ME"),
            private,
            time: chrono::Utc::now(),
            read: false,
        }
    }
}

impl Default for AdcProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdaptor for AdcProtocol {
    fn initial_lines(&mut self, _identity: &Identity) -> Vec<String> {
        vec!["HSUP ADBASE ADTIGR".to_string()]
    }

    fn send_info(&mut self, identity: &Identity) -> Vec<String> {
        let Some(sid) = self.sid else {
            return Vec::new();
        };
        let mut line = format!(
            "BINF {} ID{} PD{} NI{} SL{} SS{} SUADC0,SEGA0 VEadc-dl",
            format_sid(sid),
            self.cid,
            data_encoding::BASE32_NOPAD.encode(&self.pid),
            escape(&identity.nick),
            identity.slots.max(1),
            identity.share_size,
        );
        if !identity.description.is_empty() {
            line.push_str(&format!(" DE{}", escape(&identity.description)));
        }
        vec![line]
    }

    fn send_search(&mut self, search: &PendingSearch) -> Vec<String> {
        let Some(sid) = self.sid else {
            return Vec::new();
        };
        let mut line = format!("BSCH {}", format_sid(sid));
        if !search.token.is_empty() {
            line.push_str(&format!(" TO{}", escape(&search.token)));
        }
        if let Some(tth) = &search.query.tth {
            line.push_str(&format!(" TR{tth}"));
        } else {
            for term in &search.query.include {
                line.push_str(&format!(" AN{}", escape(term)));
            }
            for term in &search.query.exclude {
                line.push_str(&format!(" NO{}", escape(term)));
            }
            if let Some(min) = search.query.min_size {
                line.push_str(&format!(" GE{min}"));
            }
            if let Some(max) = search.query.max_size {
                line.push_str(&format!(" LE{max}"));
            }
        }
        vec![line]
    }

    fn send_password(&mut self, password: &str) -> Vec<String> {
        // PAS carries Tiger(password ++ challenge) in base32.
        let mut hasher = Tiger::new();
        hasher.update(password.as_bytes());
        hasher.update(&self.challenge);
        let digest: [u8; 24] = hasher.finalize().into();
        vec![format!(
            "HPAS {}",
            data_encoding::BASE32_NOPAD.encode(&digest)
        )]
    }

    fn send_message(&mut self, text: &str, third_person: bool) -> Vec<String> {
        let Some(sid) = self.sid else {
            return Vec::new();
        };
        let mut line = format!("BMSG {} {}", format_sid(sid), escape(text));
        if third_person {
            line.push_str(" ME1");
        }
        vec![line]
    }

    fn parse_line(&mut self, line: &str) -> Vec<ProtocolEvent> {
        let fields: Vec<String> = line.split(' ').map(str::to_string).collect();
        let Some(header) = fields.first() else {
            return Vec::new();
        };
        if header.len() != 4 {
            return vec![ProtocolEvent::Failed(format!("malformed command: {line}"))];
        }
        let command = &header[1..4];
        let rest = &fields[1..];

        match command {
            "SUP" => Vec::new(),
            "SID" => match rest.first().and_then(|s| parse_sid(s)) {
                Some(sid) => {
                    self.sid = Some(sid);
                    vec![ProtocolEvent::Handshaken]
                }
                None => vec![ProtocolEvent::Failed("SID without a sid".into())],
            },
            "INF" if header.starts_with('I') => Vec::new(),
            "INF" => {
                let Some(sid) = rest.first().and_then(|s| parse_sid(s)) else {
                    return Vec::new();
                };
                let named = Self::named_params(&rest[1..]);
                let known = self.users.get(&sid).map(|u| Identity {
                    nick: u.nick.clone(),
                    ip: u.ip.clone(),
                    cid: u.cid,
                    ..Identity::default()
                });
                let identity = Self::parse_identity(&named, known.as_ref());
                self.users.insert(
                    sid,
                    KnownUser {
                        nick: identity.nick.clone(),
                        ip: identity.ip.clone(),
                        cid: identity.cid,
                    },
                );
                let mut events = vec![ProtocolEvent::UserUpdated {
                    sid,
                    identity: identity.clone(),
                }];
                // Our own BINF coming back completes the login.
                if self.sid == Some(sid) {
                    events.push(ProtocolEvent::LoggedIn(identity));
                }
                events
            }
            "GPA" => {
                self.challenge = rest
                    .first()
                    .and_then(|c| data_encoding::BASE32_NOPAD.decode(c.as_bytes()).ok())
                    .unwrap_or_default();
                vec![ProtocolEvent::Password]
            }
            "QUI" => {
                let Some(sid) = rest.first().and_then(|s| parse_sid(s)) else {
                    return Vec::new();
                };
                let named = Self::named_params(&rest[1..]);
                if self.sid == Some(sid) {
                    if let Some(target) = named.get("RD") {
                        return vec![ProtocolEvent::Redirect(unescape(target))];
                    }
                    return vec![ProtocolEvent::Failed(
                        named
                            .get("MS")
                            .map(|m| unescape(m))
                            .unwrap_or_else(|| "kicked by hub".into()),
                    )];
                }
                self.users.remove(&sid);
                vec![ProtocolEvent::UserQuit(sid)]
            }
            "MSG" => {
                let Some(sid) = rest.first().and_then(|s| parse_sid(s)) else {
                    return Vec::new();
                };
                match header.chars().next() {
                    Some('B') => {
                        let Some(text) = rest.get(1) else {
                            return Vec::new();
                        };
                        let named = Self::named_params(&rest[2..]);
                        vec![ProtocolEvent::ChatMessage(self.chat_message(
                            sid,
                            unescape(text),
                            &named,
                            false,
                        ))]
                    }
                    Some('E') | Some('D') => {
                        let Some(text) = rest.get(2) else {
                            return Vec::new();
                        };
                        let named = Self::named_params(&rest[3..]);
                        vec![ProtocolEvent::PrivateMessage(self.chat_message(
                            sid,
                            unescape(text),
                            &named,
                            true,
                        ))]
                    }
                    _ => Vec::new(),
                }
            }
            "SCH" => {
                let Some(sid) = rest.first().and_then(|s| parse_sid(s)) else {
                    return Vec::new();
                };
                let named = Self::named_params(&rest[1..]);
                let (query, token) = Self::parse_query(&named, &rest[1..]);
                vec![ProtocolEvent::Search {
                    sid: Some(sid),
                    ip: self.flood_key(sid),
                    query,
                    token,
                }]
            }
            "RES" => {
                // DRES <source> <target> FN<path> SI<size> SL<slots> TR<tth> TO<token>
                let Some(sid) = rest.first().and_then(|s| parse_sid(s)) else {
                    return Vec::new();
                };
                let named = Self::named_params(&rest[1..]);
                let Some(path) = named.get("FN") else {
                    return Vec::new();
                };
                let user = self.users.get(&sid);
                vec![ProtocolEvent::SearchResult {
                    cid: user.and_then(|u| u.cid),
                    nick: user
                        .map(|u| u.nick.clone())
                        .unwrap_or_else(|| format_sid(sid)),
                    path: unescape(path),
                    size: named.get("SI").and_then(|v| v.parse().ok()).unwrap_or(0),
                    slots: named.get("SL").and_then(|v| v.parse().ok()).unwrap_or(0),
                    tth: named.get("TR").and_then(|t| Tth::from_base32(t)),
                    token: named.get("TO").map(|t| (*t).to_string()).unwrap_or_default(),
                }]
            }
            "CTM" => {
                // DCTM <source> <target> <protocol> <port> <token>
                let (Some(sid), Some(port), Some(token)) = (
                    rest.first().and_then(|s| parse_sid(s)),
                    rest.get(3).and_then(|p| p.parse().ok()),
                    rest.get(4),
                ) else {
                    return Vec::new();
                };
                vec![ProtocolEvent::Ctm {
                    ip: self.flood_key(sid),
                    port,
                    token: token.clone(),
                    sid: Some(sid),
                }]
            }
            "RCM" => {
                let (Some(sid), Some(token)) =
                    (rest.first().and_then(|s| parse_sid(s)), rest.get(3))
                else {
                    return Vec::new();
                };
                vec![ProtocolEvent::Rcm {
                    sid: Some(sid),
                    token: token.clone(),
                }]
            }
            "PBD" => {
                let named = Self::named_params(rest);
                vec![ProtocolEvent::Pbd(PbdParams {
                    tth: named.get("TH").and_then(|t| Tth::from_base32(t)),
                    bundle: named.get("BU").and_then(|b| b.parse().ok()),
                    update: named.contains_key("UP"),
                    add: named.contains_key("AD"),
                    remove: named.contains_key("RM"),
                })]
            }
            "STA" => {
                let code = rest.first().map(String::as_str).unwrap_or("");
                let message = rest.get(1).map(|m| unescape(m)).unwrap_or_default();
                if code.starts_with('2') {
                    vec![ProtocolEvent::Failed(message)]
                } else {
                    Vec::new()
                }
            }
            _ => {
                tracing::trace!(command, "ignored ADC command");
                Vec::new()
            }
        }
    }

    fn separator(&self) -> u8 {
        b'\n'
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn handshaken() -> AdcProtocol {
        let mut p = AdcProtocol::new();
        let events = p.parse_line("ISID AAAB");
        assert!(matches!(events[0], ProtocolEvent::Handshaken));
        p
    }

    #[test]
    fn escaping_round_trips() {
        let original = "name with spaces\\and\nnewline";
        assert_eq!(unescape(&escape(original)), original);
        assert_eq!(escape("a b"), "a\\sb");
    }

    #[test]
    fn sid_encoding_round_trips() {
        for value in [0u32, 1, 32, 1024, 0xFFFFF] {
            assert_eq!(parse_sid(&format_sid(value)), Some(value));
        }
        assert_eq!(parse_sid("x"), None);
    }

    #[test]
    fn handshake_assigns_our_sid_and_info_carries_identity() {
        let mut p = handshaken();
        let lines = p.send_info(&Identity {
            nick: "my nick".into(),
            slots: 3,
            share_size: 1234,
            ..Identity::default()
        });
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("BINF AAAB "));
        assert!(lines[0].contains("NImy\\snick"));
        assert!(lines[0].contains("SL3"));
        assert!(lines[0].contains("SS1234"));
        assert!(lines[0].contains(&format!("ID{}", p.cid())));
    }

    #[test]
    fn own_binf_completes_the_login() {
        let mut p = handshaken();

        let other = p.parse_line("BINF AAAC NIother ID0000000000000000000000000000000000000AA CT2");
        assert_eq!(other.len(), 1);
        assert!(matches!(
            &other[0],
            ProtocolEvent::UserUpdated { sid, identity } if *sid == 2 && identity.registered
        ));

        let own = p.parse_line("BINF AAAB NIme");
        assert!(matches!(own[0], ProtocolEvent::UserUpdated { sid: 1, .. }));
        assert!(matches!(
            &own[1],
            ProtocolEvent::LoggedIn(identity) if identity.nick == "me"
        ));
    }

    #[test]
    fn gpa_challenge_feeds_the_password_hash() {
        let mut p = handshaken();
        let events = p.parse_line("IGPA AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        assert!(matches!(events[0], ProtocolEvent::Password));

        let lines = p.send_password("secret");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("HPAS "));
        let digest = lines[0].strip_prefix("HPAS ").unwrap();
        assert_eq!(digest.len(), 39, "24-byte tiger digest in base32");

        // A different challenge yields a different answer.
        p.parse_line("IGPA BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB");
        assert_ne!(p.send_password("secret"), lines);
    }

    #[test]
    fn chat_messages_resolve_nicks_and_me_flag() {
        let mut p = handshaken();
        p.parse_line("BINF AAAC NIalice I4192.168.0.9");

        let events = p.parse_line("BMSG AAAC hello\\sworld");
        let ProtocolEvent::ChatMessage(msg) = &events[0] else {
            panic!("expected chat message");
        };
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.text, "hello world");
        assert!(!msg.third_person);

        let me = p.parse_line("BMSG AAAC waves ME1");
        let ProtocolEvent::ChatMessage(msg) = &me[0] else {
            panic!("expected chat message");
        };
        assert!(msg.third_person);
    }

    #[test]
    fn searches_carry_parsed_queries_and_flood_keys() {
        let mut p = handshaken();
        p.parse_line("BINF AAAC NIalice I410.1.2.3");

        let events = p.parse_line("BSCH AAAC ANlinux ANiso NOsample GE1000 LE9999 TOtok1");
        let ProtocolEvent::Search { ip, query, token, .. } = &events[0] else {
            panic!("expected search");
        };
        assert_eq!(ip, "10.1.2.3");
        assert_eq!(query.include, vec!["linux", "iso"]);
        assert_eq!(query.exclude, vec!["sample"]);
        assert_eq!(query.min_size, Some(1000));
        assert_eq!(query.max_size, Some(9999));
        assert_eq!(token, "tok1");

        let tth_search =
            p.parse_line("BSCH AAAC TRLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ TOtok2");
        let ProtocolEvent::Search { query, .. } = &tth_search[0] else {
            panic!("expected search");
        };
        assert!(query.tth.is_some());
    }

    #[test]
    fn ctm_parses_address_and_token() {
        let mut p = handshaken();
        p.parse_line("BINF AAAC NIalice I410.1.2.3");
        let events = p.parse_line("DCTM AAAC AAAB ADC/1.0 3000 tokenX");
        let ProtocolEvent::Ctm { ip, port, token, sid } = &events[0] else {
            panic!("expected CTM");
        };
        assert_eq!(ip, "10.1.2.3");
        assert_eq!(*port, 3000);
        assert_eq!(token, "tokenX");
        assert_eq!(*sid, Some(2));
    }

    #[test]
    fn search_results_resolve_the_responding_user() {
        let mut p = handshaken();
        p.parse_line("BINF AAAC NIbob IDLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ");

        let events = p.parse_line(
            "DRES AAAC AAAB FNdir/file\\sname.bin SI12345 SL2 TRLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ TOas7",
        );
        let ProtocolEvent::SearchResult {
            cid,
            nick,
            path,
            size,
            slots,
            tth,
            token,
        } = &events[0]
        else {
            panic!("expected search result");
        };
        assert!(cid.is_some());
        assert_eq!(nick, "bob");
        assert_eq!(path, "dir/file name.bin");
        assert_eq!(*size, 12345);
        assert_eq!(*slots, 2);
        assert!(tth.is_some());
        assert_eq!(token, "as7");
    }

    #[test]
    fn quit_with_redirect_targets_us() {
        let mut p = handshaken();
        let other = p.parse_line("IQUI AAAC");
        assert!(matches!(other[0], ProtocolEvent::UserQuit(2)));

        let own = p.parse_line("IQUI AAAB RDadcs://other.hub:1511");
        assert!(matches!(
            &own[0],
            ProtocolEvent::Redirect(url) if url == "adcs://other.hub:1511"
        ));
    }

    #[test]
    fn pbd_parameters_parse() {
        let mut p = handshaken();
        let events = p.parse_line(
            "DPBD AAAC THLWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ BU42 UP1 AD1",
        );
        let ProtocolEvent::Pbd(params) = &events[0] else {
            panic!("expected PBD");
        };
        assert!(params.tth.is_some());
        assert_eq!(params.bundle, Some(42));
        assert!(params.update);
        assert!(params.add);
        assert!(!params.remove);
    }

    #[test]
    fn fatal_sta_fails_the_session() {
        let mut p = handshaken();
        let events = p.parse_line("ISTA 244 Hub\\sfull");
        assert!(matches!(&events[0], ProtocolEvent::Failed(m) if m == "Hub full"));

        let benign = p.parse_line("ISTA 000 ok");
        assert!(benign.is_empty());
    }
}
