use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::domain::VersionToken;
use crate::error::MirrorError;

const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const NTP_PACKET_LEN: usize = 48;

pub trait Clock: Send + Sync {
    fn version_token(&self) -> Result<VersionToken, MirrorError>;
}

#[derive(Debug, Clone)]
pub struct NtpClock {
    server: String,
    timeout: Duration,
}

impl NtpClock {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    fn query(&self) -> Result<[u8; NTP_PACKET_LEN], MirrorError> {
        let addr = self
            .server
            .to_socket_addrs()
            .map_err(|err| MirrorError::Clock(format!("resolve {}: {err}", self.server)))?
            .next()
            .ok_or_else(|| MirrorError::Clock(format!("no address for {}", self.server)))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).map_err(|err| MirrorError::Clock(err.to_string()))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|err| MirrorError::Clock(err.to_string()))?;

        let mut request = [0u8; NTP_PACKET_LEN];
        // LI = 0, VN = 3, Mode = 3 (client)
        request[0] = 0x1b;
        socket
            .send_to(&request, addr)
            .map_err(|err| MirrorError::Clock(err.to_string()))?;

        let mut response = [0u8; NTP_PACKET_LEN];
        let (len, _) = socket
            .recv_from(&mut response)
            .map_err(|err| MirrorError::Clock(err.to_string()))?;
        if len < NTP_PACKET_LEN {
            return Err(MirrorError::Clock(format!("short NTP reply ({len} bytes)")));
        }
        Ok(response)
    }
}

impl Clock for NtpClock {
    fn version_token(&self) -> Result<VersionToken, MirrorError> {
        let packet = self.query()?;
        let token = unix_seconds_from_packet(&packet)?;
        tracing::debug!(server = %self.server, token, "network clock read");
        Ok(VersionToken(token))
    }
}

pub fn unix_seconds_from_packet(packet: &[u8; NTP_PACKET_LEN]) -> Result<u64, MirrorError> {
    let word = [packet[40], packet[41], packet[42], packet[43]];
    let ntp_seconds = u32::from_be_bytes(word) as u64;
    ntp_seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or_else(|| MirrorError::Clock(format!("timestamp before 1970: {ntp_seconds}")))
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub VersionToken);

impl Clock for FixedClock {
    fn version_token(&self) -> Result<VersionToken, MirrorError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn decodes_transmit_timestamp() {
        let mut packet = [0u8; NTP_PACKET_LEN];
        let unix = 1_700_000_000u64;
        let ntp = (unix + NTP_UNIX_OFFSET) as u32;
        packet[40..44].copy_from_slice(&ntp.to_be_bytes());
        assert_eq!(unix_seconds_from_packet(&packet).unwrap(), unix);
    }

    #[test]
    fn rejects_pre_epoch_timestamp() {
        let packet = [0u8; NTP_PACKET_LEN];
        assert_matches!(unix_seconds_from_packet(&packet), Err(MirrorError::Clock(_)));
    }
}
