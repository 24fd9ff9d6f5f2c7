//! The SDP offer carried by the INVITE.
//!
//! GB/T 28181 media negotiation is fixed-function: PS over TCP/RTP, payload
//! type 96, receive-only, passive setup, plus the GB `y=` line repeating the
//! SSRC. The offer is rendered from a handful of inputs rather than built
//! through a general SDP model.

/// Inputs for one INVITE offer.
#[derive(Debug, Clone)]
pub struct InviteSdp {
    /// The GB id of the offer's owner (the target device).
    pub owner_id: String,
    /// Public IPv4 the device should connect back to.
    pub candidate: String,
    /// TCP port the media listener accepts on.
    pub media_port: u16,
    /// The negotiated 10-digit decimal SSRC.
    pub ssrc: String,
}

impl InviteSdp {
    pub fn render(&self) -> String {
        let mut s = String::with_capacity(256);
        s.push_str("v=0\r\n");
        s.push_str(&format!(
            "o={} 0 0 IN IP4 {}\r\n",
            self.owner_id, self.candidate
        ));
        s.push_str("s=Play\r\n");
        s.push_str(&format!("c=IN IP4 {}\r\n", self.candidate));
        s.push_str("t=0 0\r\n");
        s.push_str(&format!("m=video {} TCP/RTP/AVP 96\r\n", self.media_port));
        s.push_str("a=rtpmap:96 PS/90000\r\n");
        s.push_str("a=recvonly\r\n");
        s.push_str("a=setup:passive\r\n");
        s.push_str("a=connection:new\r\n");
        s.push_str(&format!("y={}\r\n", self.ssrc));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_has_all_required_lines() {
        let sdp = InviteSdp {
            owner_id: "34020000001320000001".to_string(),
            candidate: "203.0.113.7".to_string(),
            media_port: 9000,
            ssrc: "0200001234".to_string(),
        };
        let text = sdp.render();

        for line in [
            "v=0",
            "o=34020000001320000001 0 0 IN IP4 203.0.113.7",
            "s=Play",
            "c=IN IP4 203.0.113.7",
            "t=0 0",
            "m=video 9000 TCP/RTP/AVP 96",
            "a=rtpmap:96 PS/90000",
            "a=recvonly",
            "a=setup:passive",
            "a=connection:new",
            "y=0200001234",
        ] {
            assert!(text.contains(&format!("{line}\r\n")), "missing {line}");
        }
    }
}
