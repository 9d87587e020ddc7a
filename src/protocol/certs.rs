//! CERTS cell parsing and validation
//!
//! The CERTS cell proves the relay's identity in-band, which is why the
//! outer TLS layer runs without chain validation. This module parses the
//! (type, DER) entries and enforces the link contract: no duplicate
//! types, no types above 3, and no certificate whose validity window
//! excludes the present moment. Deeper chain validation is a known gap.

use crate::error::{Result, TorError};
use std::time::SystemTime;
use x509_cert::der::Decode;
use x509_cert::Certificate;

/// Highest certificate type accepted in a CERTS cell.
const MAX_CERT_TYPE: u8 = 3;

/// One entry of a CERTS cell.
#[derive(Debug, Clone)]
pub struct LinkCert {
    /// Certificate type (1 = link, 2 = identity, 3 = auth)
    pub cert_type: u8,

    /// Raw DER bytes, retained for later inspection
    pub der: Vec<u8>,
}

/// A parsed and validated CERTS cell.
#[derive(Debug, Clone)]
pub struct CertsCell {
    pub certs: Vec<LinkCert>,
}

impl CertsCell {
    /// Parse a CERTS payload and validate every entry against `now`.
    ///
    /// Structural checks (framing, duplicate types, type bounds) run over
    /// the whole payload first; only a structurally sound cell has its
    /// certificates DER-parsed and expiry-checked.
    pub fn parse(payload: &[u8], now: SystemTime) -> Result<CertsCell> {
        let num_certs = *payload
            .first()
            .ok_or_else(|| TorError::Protocol("empty CERTS cell".into()))?;
        let mut rest = &payload[1..];

        let mut certs: Vec<LinkCert> = Vec::with_capacity(num_certs as usize);
        for _ in 0..num_certs {
            if rest.len() < 3 {
                return Err(TorError::Protocol("CERTS entry truncated".into()));
            }
            let cert_type = rest[0];
            let cert_len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            rest = &rest[3..];

            if rest.len() < cert_len {
                return Err(TorError::Protocol("CERTS entry truncated".into()));
            }
            let der = &rest[..cert_len];
            rest = &rest[cert_len..];

            if cert_type > MAX_CERT_TYPE {
                return Err(TorError::Certificate(format!(
                    "certificate type {} not allowed",
                    cert_type
                )));
            }
            if certs.iter().any(|c| c.cert_type == cert_type) {
                return Err(TorError::Certificate(format!(
                    "duplicate certificate type {}",
                    cert_type
                )));
            }

            certs.push(LinkCert {
                cert_type,
                der: der.to_vec(),
            });
        }

        for cert in &certs {
            validate_expiry(cert.cert_type, &cert.der, now)?;
            log::debug!(
                "CERTS: type {} accepted, {} bytes",
                cert.cert_type,
                cert.der.len()
            );
        }

        Ok(CertsCell { certs })
    }
}

/// Check the X.509 validity window of one DER certificate.
fn validate_expiry(cert_type: u8, der: &[u8], now: SystemTime) -> Result<()> {
    let cert = Certificate::from_der(der).map_err(|e| {
        TorError::Certificate(format!("type {} does not parse: {}", cert_type, e))
    })?;

    let validity = &cert.tbs_certificate.validity;
    let not_before = validity.not_before.to_system_time();
    let not_after = validity.not_after.to_system_time();

    if now < not_before || now > not_after {
        log::error!("CERTS: type {} outside its validity window", cert_type);
        return Err(TorError::Certificate(format!(
            "certificate type {} expired or not yet valid",
            cert_type
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cert_type: u8, der: &[u8]) -> Vec<u8> {
        let mut out = vec![cert_type];
        out.extend_from_slice(&(der.len() as u16).to_be_bytes());
        out.extend_from_slice(der);
        out
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(CertsCell::parse(&[], SystemTime::now()).is_err());
    }

    #[test]
    fn zero_certs_accepted() {
        let cell = CertsCell::parse(&[0], SystemTime::now()).unwrap();
        assert!(cell.certs.is_empty());
    }

    #[test]
    fn truncated_entry_rejected() {
        let mut payload = vec![1];
        payload.extend_from_slice(&entry(1, &[1, 2, 3])[..4]);
        assert!(CertsCell::parse(&payload, SystemTime::now()).is_err());
    }

    #[test]
    fn high_type_rejected() {
        let mut payload = vec![1];
        payload.extend_from_slice(&entry(4, &[]));
        assert!(matches!(
            CertsCell::parse(&payload, SystemTime::now()),
            Err(TorError::Certificate(_))
        ));
    }

    #[test]
    fn duplicate_type_rejected() {
        let mut payload = vec![2];
        payload.extend_from_slice(&entry(1, &[1, 2, 3]));
        payload.extend_from_slice(&entry(1, &[1, 2, 3]));
        let err = CertsCell::parse(&payload, SystemTime::now()).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }

    #[test]
    fn garbage_der_rejected() {
        let mut payload = vec![1];
        payload.extend_from_slice(&entry(1, &[0xDE, 0xAD, 0xBE, 0xEF]));
        assert!(matches!(
            CertsCell::parse(&payload, SystemTime::now()),
            Err(TorError::Certificate(_))
        ));
    }
}
