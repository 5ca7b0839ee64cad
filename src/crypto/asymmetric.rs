use anyhow::{Context, anyhow, bail};
use aws_lc_rs::encoding::{AsDer, EcPrivateKeyRfc5915Der};
use aws_lc_rs::rsa::KeySize;
use aws_lc_rs::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING};
use aws_lc_rs::signature;
use pem::Pem;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyType {
    Ecdsa(Curve),
    Rsa(KeySize),
}

impl KeyType {
    /// Short name, as used in configuration files and by ACME tooling (`ec384`, `rsa2048`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ecdsa(Curve::P256) => "ec256",
            KeyType::Ecdsa(Curve::P384) => "ec384",
            KeyType::Rsa(KeySize::Rsa2048) => "rsa2048",
            KeyType::Rsa(KeySize::Rsa3072) => "rsa3072",
            KeyType::Rsa(KeySize::Rsa4096) => "rsa4096",
            KeyType::Rsa(KeySize::Rsa8192) => "rsa8192",
            // KeySize is non-exhaustive
            KeyType::Rsa(_) => "rsa",
        }
    }
}

impl Display for KeyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            KeyType::Ecdsa(curve) => write!(f, "ECDSA with {curve}"),
            KeyType::Rsa(size) => write!(f, "RSA-{}", size.len() * 8),
        }
    }
}

impl FromStr for KeyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ec256" | "p256" => KeyType::Ecdsa(Curve::P256),
            "ec384" | "p384" => KeyType::Ecdsa(Curve::P384),
            "rsa2048" => KeyType::Rsa(KeySize::Rsa2048),
            "rsa3072" => KeyType::Rsa(KeySize::Rsa3072),
            "rsa4096" => KeyType::Rsa(KeySize::Rsa4096),
            "rsa8192" => KeyType::Rsa(KeySize::Rsa8192),
            _ => bail!("unknown key type {s}"),
        })
    }
}

impl Serialize for KeyType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for KeyType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl Curve {
    fn signing_algorithm(self) -> &'static signature::EcdsaSigningAlgorithm {
        match self {
            Curve::P256 => &ECDSA_P256_SHA256_FIXED_SIGNING,
            Curve::P384 => &ECDSA_P384_SHA384_FIXED_SIGNING,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
        }
    }
}

impl Display for Curve {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A private key held in memory.
#[derive(Debug)]
pub enum KeyPair {
    Ecdsa(EcdsaKeyPair),
    Rsa(RsaKeyPair),
}

#[derive(Debug)]
pub struct EcdsaKeyPair {
    curve: Curve,
    keypair: signature::EcdsaKeyPair,
}

#[derive(Debug)]
pub struct RsaKeyPair {
    keypair: signature::RsaKeyPair,
}

impl KeyPair {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyPair::Ecdsa(keypair) => KeyType::Ecdsa(keypair.curve),
            KeyPair::Rsa(keypair) => {
                KeyType::Rsa(match keypair.keypair.public_modulus_len() * 8 {
                    3072 => KeySize::Rsa3072,
                    4096 => KeySize::Rsa4096,
                    8192 => KeySize::Rsa8192,
                    _ => KeySize::Rsa2048,
                })
            }
        }
    }

    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        // rcgen + aws-lc-rs accept PKCS#1, PKCS#8 and SEC1 alike, and figure out the
        // algorithm by trying each option.
        let rcgen_keypair =
            rcgen::KeyPair::from_pem(pem).context("reading private key from pem failed")?;
        let pkcs8_der = rcgen_keypair.serialized_der();
        Ok(match rcgen_keypair.algorithm() {
            alg if alg == &rcgen::PKCS_ECDSA_P256_SHA256 => {
                KeyPair::Ecdsa(EcdsaKeyPair::from_pkcs8(Curve::P256, pkcs8_der)?)
            }
            alg if alg == &rcgen::PKCS_ECDSA_P384_SHA384 => {
                KeyPair::Ecdsa(EcdsaKeyPair::from_pkcs8(Curve::P384, pkcs8_der)?)
            }
            alg if alg == &rcgen::PKCS_RSA_SHA256
                || alg == &rcgen::PKCS_RSA_SHA384
                || alg == &rcgen::PKCS_RSA_SHA512 =>
            {
                KeyPair::Rsa(RsaKeyPair::from_pkcs8(pkcs8_der)?)
            }
            _ => bail!("unsupported algorithm in PEM"),
        })
    }

    /// PKCS#8 encoding (`PRIVATE KEY`)
    pub fn to_pem(&self) -> anyhow::Result<Pem> {
        let der = match self {
            KeyPair::Ecdsa(keypair) => keypair
                .keypair
                .to_pkcs8v1()
                .map_err(|_| anyhow!("Serializing ECDSA keypair failed"))?
                .as_ref()
                .to_vec(),
            KeyPair::Rsa(keypair) => keypair
                .keypair
                .as_der()
                .map_err(|_| anyhow!("Serializing RSA keypair failed"))?
                .as_ref()
                .to_vec(),
        };
        Ok(Pem::new("PRIVATE KEY", der))
    }

    /// Algorithm-specific encoding. ECDSA keys become SEC1 `EC PRIVATE KEY` blocks, which is
    /// what most ACME tooling expects for account keys. RSA keys stay PKCS#8.
    pub fn to_legacy_pem(&self) -> anyhow::Result<Pem> {
        match self {
            KeyPair::Ecdsa(keypair) => {
                let der: EcPrivateKeyRfc5915Der = keypair
                    .keypair
                    .private_key()
                    .as_der()
                    .map_err(|_| anyhow!("Serializing ECDSA keypair failed"))?;
                Ok(Pem::new("EC PRIVATE KEY", der.as_ref()))
            }
            KeyPair::Rsa(_) => self.to_pem(),
        }
    }
}

impl EcdsaKeyPair {
    fn from_pkcs8(curve: Curve, der: &[u8]) -> anyhow::Result<Self> {
        let keypair = signature::EcdsaKeyPair::from_pkcs8(curve.signing_algorithm(), der)
            .map_err(|_| anyhow!("ECDSA private key is corrupted or invalid"))?;
        Ok(Self { curve, keypair })
    }
}

impl RsaKeyPair {
    fn from_pkcs8(der: &[u8]) -> anyhow::Result<Self> {
        let keypair = signature::RsaKeyPair::from_pkcs8(der)
            .map_err(|_| anyhow!("RSA private key is corrupted or invalid"))?;
        Ok(Self { keypair })
    }
}

pub fn new_key(typ: KeyType) -> anyhow::Result<KeyPair> {
    Ok(match typ {
        KeyType::Ecdsa(curve) => {
            let keypair = signature::EcdsaKeyPair::generate(curve.signing_algorithm())
                .map_err(|_| anyhow!("Could not generate key"))?;
            KeyPair::Ecdsa(EcdsaKeyPair { curve, keypair })
        }
        KeyType::Rsa(size) => {
            let keypair = signature::RsaKeyPair::generate(size)
                .map_err(|_| anyhow!("Could not generate key"))?;
            KeyPair::Rsa(RsaKeyPair { keypair })
        }
    })
}
