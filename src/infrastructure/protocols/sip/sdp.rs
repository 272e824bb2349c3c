//! Simple SDP (Session Description Protocol) handling
//!
//! The offer is a fixed audio-only template; the answer is only read for the
//! remote RTP address and port.

use std::net::IpAddr;

/// Static audio offer: PCMU, PCMA, G729 and RFC 4733 events
const OFFERED_FORMATS: [(&str, &str); 4] = [
    ("0", "PCMU/8000"),
    ("8", "PCMA/8000"),
    ("18", "G729/8000"),
    ("101", "telephone-event/8000"),
];

const SESSION_NAME: &str = "usip";

/// Simple SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: if ip.is_ipv4() { "IP4" } else { "IP6" }.to_string(),
            address: ip.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub rtpmap: Vec<(String, String)>,
    pub fmtp: Vec<(String, String)>,
    /// Media-level `c=` line, overriding the session one
    pub connection: Option<SdpConnection>,
    pub direction: Option<String>,
}

impl SdpSession {
    /// Create the audio offer sent with every INVITE
    pub fn create_audio_offer(username: &str, local_ip: IpAddr, local_port: u16) -> Self {
        let connection = SdpConnection::for_ip(local_ip);
        Self {
            version: 0,
            origin: SdpOrigin {
                username: username.to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                network_type: connection.network_type.clone(),
                address_type: connection.address_type.clone(),
                address: connection.address.clone(),
            },
            session_name: SESSION_NAME.to_string(),
            connection: Some(connection),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: OFFERED_FORMATS.iter().map(|(pt, _)| pt.to_string()).collect(),
                rtpmap: OFFERED_FORMATS
                    .iter()
                    .map(|(pt, enc)| (pt.to_string(), enc.to_string()))
                    .collect(),
                fmtp: vec![("101".to_string(), "0-16".to_string())],
                connection: None,
                direction: Some("sendrecv".to_string()),
            }],
        }
    }

    /// Convert to SDP string
    pub fn to_sdp_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!(
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(c) = &self.connection {
            sdp.push_str(&format!(
                "c={} {} {}\r\n",
                c.network_type, c.address_type, c.address
            ));
        }
        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));
            if let Some(c) = &media.connection {
                sdp.push_str(&format!(
                    "c={} {} {}\r\n",
                    c.network_type, c.address_type, c.address
                ));
            }
            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }
            for (pt, params) in &media.fmtp {
                sdp.push_str(&format!("a=fmtp:{} {}\r\n", pt, params));
            }
            if let Some(direction) = &media.direction {
                sdp.push_str(&format!("a={}\r\n", direction));
            }
        }

        sdp
    }

    /// Parse SDP from string
    ///
    /// Lines that do not parse are skipped; `None` only when there is no
    /// origin line at all.
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            // Multicast TTL suffix is not relevant here
                            address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                        };
                        match current_media.as_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next().and_then(|p| p.parse().ok()).unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            fmtp: Vec::new(),
                            connection: None,
                            direction: None,
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
                            if let Some((pt, params)) = fmtp.split_once(' ') {
                                media.fmtp.push((pt.to_string(), params.to_string()));
                            }
                        } else if matches!(value, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
                            media.direction = Some(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Remote RTP address and port for the audio stream
    pub fn audio_endpoint(&self) -> Option<(String, u16)> {
        let audio = self.audio_media().filter(|m| m.port != 0)?;
        let connection = audio.connection.as_ref().or(self.connection.as_ref())?;
        Some((connection.address.clone(), audio.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_offer() {
        let offer = SdpSession::create_audio_offer("alice", "192.0.2.10".parse().unwrap(), 10000);
        let text = offer.to_sdp_string();

        assert!(text.contains("c=IN IP4 192.0.2.10\r\n"));
        assert!(text.contains("m=audio 10000 RTP/AVP 0 8 18 101\r\n"));
        assert!(text.contains("a=rtpmap:18 G729/8000\r\n"));
        assert!(text.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(text.contains("a=fmtp:101 0-16\r\n"));
        assert!(text.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn test_parse_offer_back() {
        let offer = SdpSession::create_audio_offer("alice", "192.0.2.10".parse().unwrap(), 10000);
        let parsed = SdpSession::parse(&offer.to_sdp_string()).unwrap();
        assert_eq!(parsed.audio_endpoint(), Some(("192.0.2.10".to_string(), 10000)));
        assert_eq!(parsed.audio_media().unwrap().rtpmap.len(), 4);
    }

    #[test]
    fn test_media_level_connection_wins() {
        let answer = "v=0\r\no=- 1 1 IN IP4 198.51.100.1\r\ns=-\r\nc=IN IP4 198.51.100.1\r\nt=0 0\r\n\
                      m=audio 40000 RTP/AVP 0\r\nc=IN IP4 203.0.113.7\r\na=rtpmap:0 PCMU/8000\r\n";
        let sdp = SdpSession::parse(answer).unwrap();
        assert_eq!(sdp.audio_endpoint(), Some(("203.0.113.7".to_string(), 40000)));
    }

    #[test]
    fn test_rejected_or_missing_audio() {
        let answer = "v=0\no=- 1 1 IN IP4 198.51.100.1\ns=-\nc=IN IP4 198.51.100.1\nm=audio 0 RTP/AVP 0\n";
        let sdp = SdpSession::parse(answer).unwrap();
        assert_eq!(sdp.audio_endpoint(), None);

        assert!(SdpSession::parse("not sdp at all").is_none());
    }
}
