//! Cipher methods and their wire parameters

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use thiserror::Error;

/// Category of a cipher method, deciding which transport protocol is spoken
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CipherCategory {
    /// No encryption
    None,
    /// Legacy stream ciphers, <https://shadowsocks.org/en/spec/Stream-Ciphers.html>
    Stream,
    /// AEAD ciphers, <https://shadowsocks.org/en/spec/AEAD-Ciphers.html>
    Aead,
    /// AEAD 2022 ciphers, <https://shadowsocks.org/en/spec/2022-1-Shadowsocks-2022-Edition.html>
    Aead2022,
}

/// Cipher method identifier
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CipherKind {
    NONE,

    AES_128_CTR,
    AES_192_CTR,
    AES_256_CTR,
    AES_128_CFB,
    AES_192_CFB,
    AES_256_CFB,
    RC4_MD5,
    CHACHA20,
    XCHACHA20,

    AES_128_GCM,
    AES_256_GCM,
    CHACHA20_POLY1305,
    XCHACHA20_POLY1305,

    AEAD2022_BLAKE3_AES_128_GCM,
    AEAD2022_BLAKE3_AES_256_GCM,
}

impl CipherKind {
    /// Category of the method
    pub fn category(&self) -> CipherCategory {
        match *self {
            Self::NONE => CipherCategory::None,

            Self::AES_128_CTR
            | Self::AES_192_CTR
            | Self::AES_256_CTR
            | Self::AES_128_CFB
            | Self::AES_192_CFB
            | Self::AES_256_CFB
            | Self::RC4_MD5
            | Self::CHACHA20
            | Self::XCHACHA20 => CipherCategory::Stream,

            Self::AES_128_GCM | Self::AES_256_GCM | Self::CHACHA20_POLY1305 | Self::XCHACHA20_POLY1305 => {
                CipherCategory::Aead
            }

            Self::AEAD2022_BLAKE3_AES_128_GCM | Self::AEAD2022_BLAKE3_AES_256_GCM => CipherCategory::Aead2022,
        }
    }

    /// Check if this is the "none" (identity) method
    pub fn is_none(&self) -> bool {
        matches!(*self, Self::NONE)
    }

    /// Check if the method is an AEAD 2022 method
    pub fn is_aead_2022(&self) -> bool {
        self.category() == CipherCategory::Aead2022
    }

    /// Check if the method supports Extensible Identity Headers
    pub fn support_eih(&self) -> bool {
        matches!(*self, Self::AEAD2022_BLAKE3_AES_128_GCM | Self::AEAD2022_BLAKE3_AES_256_GCM)
    }

    /// Length of the master key in bytes
    #[rustfmt::skip]
    pub fn key_len(&self) -> usize {
        match *self {
            Self::NONE                        => 0,

            Self::AES_128_CTR                 => 16,
            Self::AES_192_CTR                 => 24,
            Self::AES_256_CTR                 => 32,
            Self::AES_128_CFB                 => 16,
            Self::AES_192_CFB                 => 24,
            Self::AES_256_CFB                 => 32,
            Self::RC4_MD5                     => 16,
            Self::CHACHA20                    => 32,
            Self::XCHACHA20                   => 32,

            Self::AES_128_GCM                 => 16,
            Self::AES_256_GCM                 => 32,
            Self::CHACHA20_POLY1305           => 32,
            Self::XCHACHA20_POLY1305          => 32,

            Self::AEAD2022_BLAKE3_AES_128_GCM => 16,
            Self::AEAD2022_BLAKE3_AES_256_GCM => 32,
        }
    }

    /// Length of the IV sent before a stream-cipher session
    #[rustfmt::skip]
    pub fn iv_len(&self) -> usize {
        match *self {
            Self::AES_128_CTR
            | Self::AES_192_CTR
            | Self::AES_256_CTR
            | Self::AES_128_CFB
            | Self::AES_192_CFB
            | Self::AES_256_CFB => 16,
            Self::RC4_MD5       => 0,
            Self::CHACHA20      => 12,
            Self::XCHACHA20     => 24,
            _                   => 0,
        }
    }

    /// Length of the salt sent before an AEAD session
    #[rustfmt::skip]
    pub fn salt_len(&self) -> usize {
        match *self {
            Self::AES_128_GCM                 => 16,
            Self::AES_256_GCM                 => 32,
            Self::CHACHA20_POLY1305           => 32,
            Self::XCHACHA20_POLY1305          => 32,

            Self::AEAD2022_BLAKE3_AES_128_GCM => 16,
            Self::AEAD2022_BLAKE3_AES_256_GCM => 32,

            _                                 => 0,
        }
    }

    /// Length of the authentication tag appended to every AEAD message
    pub fn tag_len(&self) -> usize {
        match self.category() {
            CipherCategory::Aead | CipherCategory::Aead2022 => 16,
            _ => 0,
        }
    }

    /// Length of the per-message AEAD nonce
    #[rustfmt::skip]
    pub fn nonce_len(&self) -> usize {
        match *self {
            Self::AES_128_GCM
            | Self::AES_256_GCM
            | Self::CHACHA20_POLY1305         => 12,
            Self::XCHACHA20_POLY1305          => 24,

            Self::AEAD2022_BLAKE3_AES_128_GCM
            | Self::AEAD2022_BLAKE3_AES_256_GCM => 12,

            _                                 => 0,
        }
    }
}

impl Display for CipherKind {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::NONE                        => "none",

            Self::AES_128_CTR                 => "aes-128-ctr",
            Self::AES_192_CTR                 => "aes-192-ctr",
            Self::AES_256_CTR                 => "aes-256-ctr",
            Self::AES_128_CFB                 => "aes-128-cfb",
            Self::AES_192_CFB                 => "aes-192-cfb",
            Self::AES_256_CFB                 => "aes-256-cfb",
            Self::RC4_MD5                     => "rc4-md5",
            Self::CHACHA20                    => "chacha20-ietf",
            Self::XCHACHA20                   => "xchacha20",

            Self::AES_128_GCM                 => "aes-128-gcm",
            Self::AES_256_GCM                 => "aes-256-gcm",
            Self::CHACHA20_POLY1305           => "chacha20-ietf-poly1305",
            Self::XCHACHA20_POLY1305          => "xchacha20-ietf-poly1305",

            Self::AEAD2022_BLAKE3_AES_128_GCM => "2022-blake3-aes-128-gcm",
            Self::AEAD2022_BLAKE3_AES_256_GCM => "2022-blake3-aes-256-gcm",
        })
    }
}

/// Error while parsing a method name
#[derive(Debug, Clone, Error)]
#[error("unsupported method")]
pub struct ParseCipherKindError;

impl FromStr for CipherKind {
    type Err = ParseCipherKindError;

    #[rustfmt::skip]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "plain" | "dummy"  => Ok(Self::NONE),

            "aes-128-ctr"               => Ok(Self::AES_128_CTR),
            "aes-192-ctr"               => Ok(Self::AES_192_CTR),
            "aes-256-ctr"               => Ok(Self::AES_256_CTR),
            "aes-128-cfb"               => Ok(Self::AES_128_CFB),
            "aes-192-cfb"               => Ok(Self::AES_192_CFB),
            "aes-256-cfb"               => Ok(Self::AES_256_CFB),
            "rc4-md5"                   => Ok(Self::RC4_MD5),
            "chacha20-ietf"             => Ok(Self::CHACHA20),
            "xchacha20"                 => Ok(Self::XCHACHA20),

            "aes-128-gcm"               => Ok(Self::AES_128_GCM),
            "aes-256-gcm"               => Ok(Self::AES_256_GCM),
            "chacha20-ietf-poly1305"    => Ok(Self::CHACHA20_POLY1305),
            "xchacha20-ietf-poly1305"   => Ok(Self::XCHACHA20_POLY1305),

            "2022-blake3-aes-128-gcm"   => Ok(Self::AEAD2022_BLAKE3_AES_128_GCM),
            "2022-blake3-aes-256-gcm"   => Ok(Self::AEAD2022_BLAKE3_AES_256_GCM),

            _                           => Err(ParseCipherKindError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        let kind = "aes-256-gcm".parse::<CipherKind>().unwrap();
        assert_eq!(kind, CipherKind::AES_256_GCM);
        assert_eq!(kind.key_len(), 32);
        assert_eq!(kind.salt_len(), 32);
        assert_eq!(kind.tag_len(), 16);

        let kind = "2022-blake3-aes-128-gcm".parse::<CipherKind>().unwrap();
        assert!(kind.is_aead_2022());
        assert!(kind.support_eih());
        assert_eq!(kind.key_len(), 16);
    }

    #[test]
    fn parse_sentinels() {
        for name in ["none", "plain", "dummy"] {
            assert_eq!(name.parse::<CipherKind>().unwrap(), CipherKind::NONE);
        }
    }

    #[test]
    fn parse_unknown_method() {
        assert!("aes-128-xyz".parse::<CipherKind>().is_err());
    }

    #[test]
    fn display_round_trip() {
        let kind = CipherKind::CHACHA20_POLY1305;
        assert_eq!(kind.to_string().parse::<CipherKind>().unwrap(), kind);
    }
}
