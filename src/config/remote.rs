//! Remote fallback configuration document
//!
//! The document is fetched as JSON, parsed into [`RemoteConfig`], and must pass
//! [`RemoteConfig::validate`] before anything downstream may see it. A single
//! bad fallback entry rejects the whole document.

use crate::{Error, Result};
use rand::RngCore;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Configuration document as published by the config source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Document version (informational)
    #[serde(default)]
    pub serial_no: i64,

    /// Controller address (unused by the relay)
    #[serde(default)]
    pub controller: String,

    /// Lower bound of the next poll delay, minutes
    #[serde(default)]
    pub minpoll: i64,

    /// Upper bound (exclusive) of the next poll delay, minutes
    #[serde(default)]
    pub maxpoll: i64,

    #[serde(default)]
    pub fallbacks: Vec<FallbackSpec>,
}

/// One fallback endpoint as declared in the document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackSpec {
    /// Host or IP address
    pub ip: String,

    /// Port, published as a string but tolerated as a number
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,

    /// Protocol (informational)
    #[serde(default)]
    pub protocol: String,

    /// Credential presented to the fallback
    #[serde(default)]
    pub auth_token: String,

    /// PEM encoded server certificate
    pub cert: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(s) => s,
        Port::Number(n) => n.to_string(),
    })
}

/// Jitter window for the next poll, in minutes. `0 < min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollWindow {
    pub min_minutes: u64,
    pub max_minutes: u64,
}

impl PollWindow {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Result<Self> {
        if min_minutes == 0 || min_minutes >= max_minutes {
            return Err(Error::config(format!(
                "Invalid poll window [{}, {}): need 0 < min < max",
                min_minutes, max_minutes
            )));
        }
        Ok(PollWindow {
            min_minutes,
            max_minutes,
        })
    }

    /// Uniform draw from `[min, max)` minutes
    pub fn next_delay<R: RngCore>(&self, rng: &mut R) -> Duration {
        let minutes = crate::common::random::jitter(rng, self.min_minutes, self.max_minutes);
        Duration::from_secs(minutes * 60)
    }
}

/// A fallback whose port and certificate have been checked
#[derive(Debug, Clone)]
pub struct ValidatedFallback {
    pub spec: FallbackSpec,
    pub port: u16,
    pub cert: CertificateDer<'static>,
}

/// A document that passed validation. Only this type reaches the registry.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub serial_no: i64,
    pub controller: String,
    pub poll: PollWindow,
    pub fallbacks: Vec<ValidatedFallback>,
}

impl RemoteConfig {
    /// Parse a JSON document
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Check the poll window and every fallback; any failure rejects the
    /// whole document.
    pub fn validate(self) -> Result<ValidatedConfig> {
        let poll = PollWindow::new(
            u64::try_from(self.minpoll).unwrap_or(0),
            u64::try_from(self.maxpoll).unwrap_or(0),
        )?;

        let fallbacks = self
            .fallbacks
            .into_iter()
            .map(validate_fallback)
            .collect::<Result<Vec<_>>>()?;

        Ok(ValidatedConfig {
            serial_no: self.serial_no,
            controller: self.controller,
            poll,
            fallbacks,
        })
    }
}

fn validate_fallback(spec: FallbackSpec) -> Result<ValidatedFallback> {
    if spec.ip.trim().is_empty() {
        return Err(Error::config("Fallback has no address"));
    }

    let port: u16 = spec
        .port
        .trim()
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::config(format!("Invalid port for {}: {:?}", spec.ip, spec.port)))?;

    let cert = parse_certificate(&spec.cert)
        .map_err(|e| Error::certificate(format!("{} ({}:{})", e, spec.ip, port)))?;

    Ok(ValidatedFallback { spec, port, cert })
}

/// Decode PEM text that must contain exactly one well-formed X.509 certificate.
pub fn parse_certificate(pem: &str) -> Result<CertificateDer<'static>> {
    let mut certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::certificate(format!("Invalid PEM: {}", e)))?;

    let cert = match certs.len() {
        0 => return Err(Error::certificate("No PEM encoded certificate found")),
        1 => certs.remove(0),
        n => {
            return Err(Error::certificate(format!(
                "Expected exactly one certificate, found {}",
                n
            )))
        }
    };

    let (rest, _) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| Error::certificate(format!("Malformed X.509 certificate: {}", e)))?;
    if !rest.is_empty() {
        return Err(Error::certificate(
            "Trailing data after X.509 certificate",
        ));
    }

    Ok(cert)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::random::secure_rng;

    pub(crate) fn test_cert_pem() -> String {
        rcgen::generate_simple_self_signed(vec!["fallback.test".to_string()])
            .unwrap()
            .cert
            .pem()
    }

    fn document(cert: &str) -> String {
        serde_json::json!({
            "serial_no": 7,
            "controller": "controller@example.com",
            "minpoll": 2,
            "maxpoll": 4,
            "fallbacks": [
                { "ip": "10.0.0.1", "port": "443", "protocol": "tcp",
                  "auth_token": "secret-a", "cert": cert },
                { "ip": "10.0.0.2", "port": 8443, "protocol": "tcp",
                  "auth_token": "secret-b", "cert": cert }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_parse_and_validate() {
        let pem = test_cert_pem();
        let config = RemoteConfig::from_slice(document(&pem).as_bytes()).unwrap();
        assert_eq!(config.serial_no, 7);
        assert_eq!(config.fallbacks[1].port, "8443");

        let validated = config.validate().unwrap();
        assert_eq!(validated.poll, PollWindow::new(2, 4).unwrap());
        assert_eq!(validated.fallbacks.len(), 2);
        assert_eq!(validated.fallbacks[0].port, 443);
        assert_eq!(validated.fallbacks[0].spec.auth_token, "secret-a");
    }

    #[test]
    fn test_one_bad_cert_rejects_document() {
        let pem = test_cert_pem();
        let mut config = RemoteConfig::from_slice(document(&pem).as_bytes()).unwrap();
        config.fallbacks[1].cert = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".to_string();
        assert!(matches!(config.validate(), Err(Error::Certificate(_))));
    }

    #[test]
    fn test_parse_certificate_requires_exactly_one() {
        let pem = test_cert_pem();
        parse_certificate(&pem).unwrap();

        assert!(parse_certificate("not a pem").is_err());
        assert!(parse_certificate("").is_err());

        let two = format!("{}{}", pem, pem);
        let err = parse_certificate(&two).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_invalid_poll_window_rejected() {
        let pem = test_cert_pem();
        let mut config = RemoteConfig::from_slice(document(&pem).as_bytes()).unwrap();
        config.minpoll = 5;
        config.maxpoll = 5;
        assert!(config.clone().validate().is_err());

        config.minpoll = -1;
        config.maxpoll = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let pem = test_cert_pem();
        let mut config = RemoteConfig::from_slice(document(&pem).as_bytes()).unwrap();
        config.fallbacks[0].port = "70000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_undecodable_json() {
        assert!(matches!(
            RemoteConfig::from_slice(b"<html>denied</html>"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_poll_delay_within_window() {
        let window = PollWindow::new(5, 15).unwrap();
        let mut rng = secure_rng().unwrap();
        for _ in 0..2_000 {
            let delay = window.next_delay(&mut rng);
            assert!(delay >= Duration::from_secs(5 * 60));
            assert!(delay < Duration::from_secs(15 * 60));
            assert_eq!(delay.as_secs() % 60, 0);
        }
    }
}
