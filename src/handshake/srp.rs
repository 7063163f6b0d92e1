//! SRP-6a password proof (SHA-256).
//!
//! ```text
//! x  = H(s || H(I ":" mix(password, loginData)))
//! v  = g^x mod N
//! A  = g^a mod N
//! u  = H(PAD(A) || PAD(B))
//! S  = (B - k*v)^(a + u*x) mod N
//! M1 = H(PAD(A) || PAD(B) || PAD(S))
//! M2 = H(PAD(A) || PAD(M1) || PAD(S))
//! K  = H(PAD(S))
//! ```
//!
//! `PAD` left-pads to the byte length of `N`. The client releases `K` only
//! after the server's `M2` matches; an instance authenticates at most once
//! and must be [`SrpClient::clear`]ed before reuse.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use num_bigint::BigUint;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::{decode_b64, encode_b64, from_hex, to_hex, ClientHandshake, Established, ServerHandshake, Step};
use crate::constants::RANDOM_SIZE;
use crate::crypto::{constant_time_eq, CryptoService};
use crate::error::{Result, SessionError};

/// Smallest modulus accepted from a server challenge.
const MIN_MODULUS_BITS: u64 = 1024;

/// RFC 5054 2048-bit group modulus.
const RFC5054_2048_N: &str = concat!(
    "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050",
    "A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50",
    "E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8",
    "55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B",
    "CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748",
    "544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6",
    "AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6",
    "94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73",
);

/// An SRP group `(N, g)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrpGroup {
    modulus: BigUint,
    generator: BigUint,
}

impl SrpGroup {
    /// The RFC 5054 2048-bit group with `g = 2`.
    pub fn rfc5054_2048() -> Self {
        Self {
            modulus: parse_big("N", RFC5054_2048_N).expect("RFC 5054 modulus"),
            generator: BigUint::from(2u8),
        }
    }

    /// Group from explicit values.
    pub fn new(modulus: BigUint, generator: BigUint) -> Result<Self> {
        if modulus.bits() < MIN_MODULUS_BITS {
            return Err(SessionError::Auth(format!(
                "SRP modulus too small: {} bits",
                modulus.bits()
            )));
        }
        if generator <= BigUint::from(1u8) || generator >= modulus {
            return Err(SessionError::Auth("SRP generator out of range".into()));
        }
        Ok(Self {
            modulus,
            generator,
        })
    }

    /// Modulus `N`.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Generator `g`.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Byte length of `N`.
    pub fn len(&self) -> usize {
        (self.modulus.bits() as usize).div_ceil(8)
    }

    /// `true` for a zero modulus.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Big-endian bytes of `value`, left-padded to the length of `N`.
    pub fn pad(&self, value: &BigUint) -> Vec<u8> {
        pad_to(&value.to_bytes_be(), self.len())
    }

    /// Multiplier `k = H(PAD(N) || PAD(g))`.
    pub fn multiplier(&self, crypto: &dyn CryptoService) -> BigUint {
        BigUint::from_bytes_be(&hash(
            crypto,
            &[&self.pad(&self.modulus), &self.pad(&self.generator)],
        ))
    }
}

fn pad_to(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

fn hash(crypto: &dyn CryptoService, parts: &[&[u8]]) -> Vec<u8> {
    crypto.sha256(&parts.concat())
}

fn parse_big(field: &str, hex: &str) -> Result<BigUint> {
    BigUint::parse_bytes(hex.as_bytes(), 16)
        .ok_or_else(|| SessionError::Protocol(format!("invalid big integer in {field}")))
}

fn big_hex(value: &BigUint) -> String {
    value.to_str_radix(16)
}

/// Random value with the byte length of `N`, never zero.
fn random_exponent(crypto: &dyn CryptoService, group: &SrpGroup) -> BigUint {
    loop {
        let candidate = BigUint::from_bytes_be(&crypto.random_bytes(group.len()));
        if candidate.bits() > 0 {
            return candidate;
        }
    }
}

/// `x = H(s || H(I ":" password))`.
fn private_key(crypto: &dyn CryptoService, salt: &[u8], identity: &str, password: &str) -> BigUint {
    let inner = Zeroizing::new(crypto.sha256(format!("{identity}:{password}").as_bytes()));
    BigUint::from_bytes_be(&hash(crypto, &[salt, &inner]))
}

/// Verifier `v = g^x mod N` for an (already mixed) password.
pub fn compute_verifier(
    crypto: &dyn CryptoService,
    group: &SrpGroup,
    identity: &str,
    password: &str,
    salt: &[u8],
) -> BigUint {
    let x = private_key(crypto, salt, identity, password);
    group.generator.modpow(&x, &group.modulus)
}

/// Server-side password transform driven by the challenge's `loginData`.
pub trait PasswordMixer: Send + Sync + std::fmt::Debug {
    /// Return the effective password fed into `x`.
    fn mix(&self, password: &str, login_data: Option<&serde_json::Value>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct LoginData {
    algorithm: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    salt: Option<String>,
    #[serde(default)]
    rounds: Option<u32>,
    #[serde(default)]
    length: Option<usize>,
}

/// Understands `{algorithm: "PBKDF2", hash: "SHA512", salt, rounds, length}`
/// (hex output) and `{algorithm: "none"}` / null (password unchanged).
#[derive(Debug, Clone)]
pub struct DefaultPasswordMixer {
    crypto: Arc<dyn CryptoService>,
}

impl DefaultPasswordMixer {
    /// Mixer backed by `crypto`.
    pub fn new(crypto: Arc<dyn CryptoService>) -> Self {
        Self { crypto }
    }
}

impl PasswordMixer for DefaultPasswordMixer {
    fn mix(&self, password: &str, login_data: Option<&serde_json::Value>) -> Result<String> {
        let Some(value) = login_data.filter(|v| !v.is_null()) else {
            return Ok(password.to_string());
        };
        let data: LoginData = serde_json::from_value(value.clone())
            .map_err(|e| SessionError::Auth(format!("malformed loginData: {e}")))?;

        match data.algorithm.to_ascii_lowercase().as_str() {
            "none" => Ok(password.to_string()),
            "pbkdf2" => {
                let hash = data.hash.as_deref().unwrap_or("SHA512");
                if !hash.eq_ignore_ascii_case("sha512") {
                    return Err(SessionError::Auth(format!(
                        "unsupported loginData hash: {hash}"
                    )));
                }
                let salt = decode_b64("loginData.salt", data.salt.as_deref().unwrap_or(""))?;
                let rounds = data
                    .rounds
                    .filter(|r| *r > 0)
                    .ok_or_else(|| SessionError::Auth("loginData rounds missing".into()))?;
                let derived = Zeroizing::new(self.crypto.pbkdf2_sha512(
                    password.as_bytes(),
                    &salt,
                    rounds,
                    data.length.unwrap_or(32),
                ));
                Ok(to_hex(&derived))
            }
            other => Err(SessionError::Auth(format!(
                "unsupported loginData algorithm: {other}"
            ))),
        }
    }
}

enum SrpState {
    Idle,
    AwaitingChallenge {
        client_random: Vec<u8>,
    },
    AwaitingProof {
        client_random: Vec<u8>,
        server_random: Vec<u8>,
        expected_m2: Vec<u8>,
        key: Zeroizing<Vec<u8>>,
    },
    Finished,
}

impl SrpState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingChallenge { .. } => "awaiting challenge",
            Self::AwaitingProof { .. } => "awaiting proof",
            Self::Finished => "finished",
        }
    }
}

/// Values the client sends in `srp_exchange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProof {
    /// Public value `A`.
    pub a_pub: BigUint,
    /// Proof `M1`.
    pub m1: Vec<u8>,
}

/// Client side of the SRP exchange.
pub struct SrpClient {
    crypto: Arc<dyn CryptoService>,
    mixer: Arc<dyn PasswordMixer>,
    host: String,
    tickets: u32,
    identity: String,
    password: Zeroizing<String>,
    state: SrpState,
}

impl std::fmt::Debug for SrpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrpClient")
            .field("identity", &self.identity)
            .field("state", &self.state.name())
            .finish()
    }
}

impl SrpClient {
    /// Client without credentials; call [`SrpClient::init`] before starting.
    pub fn new(
        crypto: Arc<dyn CryptoService>,
        mixer: Arc<dyn PasswordMixer>,
        host: &str,
        tickets: u32,
    ) -> Self {
        Self {
            crypto,
            mixer,
            host: host.to_string(),
            tickets,
            identity: String::new(),
            password: Zeroizing::new(String::new()),
            state: SrpState::Idle,
        }
    }

    /// Set the credentials. Both must be non-empty.
    pub fn init(&mut self, identity: &str, password: &str) -> Result<()> {
        if identity.is_empty() || password.is_empty() {
            return Err(SessionError::InvalidState(
                "SRP identity and password must be non-empty".into(),
            ));
        }
        if !matches!(self.state, SrpState::Idle) {
            return Err(SessionError::InvalidState(format!(
                "SRP client cannot be initialized while {}",
                self.state.name()
            )));
        }
        self.identity = identity.to_string();
        self.password = Zeroizing::new(password.to_string());
        Ok(())
    }

    /// Forget credentials and handshake state so the instance can be reused.
    pub fn clear(&mut self) {
        self.identity.clear();
        self.password = Zeroizing::new(String::new());
        self.state = SrpState::Idle;
    }

    /// Build the `srp_init` greeting.
    pub fn start(&mut self) -> Result<ClientHandshake> {
        if self.identity.is_empty() {
            return Err(SessionError::InvalidState("SRP client not initialized".into()));
        }
        if !matches!(self.state, SrpState::Idle) {
            return Err(SessionError::InvalidState(format!(
                "SRP handshake cannot start while {}",
                self.state.name()
            )));
        }
        let client_random = self.crypto.random_bytes(RANDOM_SIZE);
        let message = ClientHandshake::SrpInit {
            identity: self.identity.clone(),
            host: self.host.clone(),
            client_random: encode_b64(&client_random),
        };
        self.state = SrpState::AwaitingChallenge { client_random };
        Ok(message)
    }

    /// Feed a server message.
    pub fn on_message(&mut self, message: ServerHandshake) -> Result<Step> {
        match (std::mem::replace(&mut self.state, SrpState::Finished), message) {
            (
                SrpState::AwaitingChallenge { client_random },
                ServerHandshake::SrpInit {
                    session_id,
                    s,
                    b_pub,
                    modulus,
                    g,
                    k,
                    login_data,
                    server_random,
                },
            ) => {
                let group = SrpGroup::new(parse_big("N", &modulus)?, parse_big("g", &g)?)?;
                let salt = from_hex("s", &s)?;
                let b_pub = parse_big("B", &b_pub)?;
                let k = parse_big("k", &k)?;
                let server_random = decode_b64("serverRandom", &server_random)?;

                let password = Zeroizing::new(self.mixer.mix(&self.password, login_data.as_ref())?);
                let (proof, expected_m2, key) =
                    self.compute_proof(&group, &k, &salt, &b_pub, &password)?;

                self.state = SrpState::AwaitingProof {
                    client_random,
                    server_random,
                    expected_m2,
                    key,
                };
                Ok(Step::Reply(ClientHandshake::SrpExchange {
                    a_pub: big_hex(&proof.a_pub),
                    m1: to_hex(&proof.m1),
                    session_id,
                    tickets: self.tickets,
                }))
            }
            (
                SrpState::AwaitingProof {
                    client_random,
                    server_random,
                    expected_m2,
                    key,
                },
                ServerHandshake::SrpExchange { m2, tickets, ttl },
            ) => {
                let m2 = from_hex("M2", &m2)?;
                if !constant_time_eq(&m2, &expected_m2) {
                    return Err(SessionError::Auth("server proof M2 mismatch".into()));
                }
                log::debug!("[SRP] Server proof verified for {}", self.identity);
                Ok(Step::Established(Established {
                    master_secret: key,
                    client_random,
                    server_random,
                    tickets,
                    ttl_secs: ttl,
                }))
            }
            (state, message) => {
                let err = SessionError::InvalidState(format!(
                    "unexpected {} while SRP client is {}",
                    message.kind(),
                    state.name()
                ));
                self.state = state;
                Err(err)
            }
        }
    }

    /// Compute `A`, `M1`, the expected `M2` and `K` for a challenge.
    fn compute_proof(
        &self,
        group: &SrpGroup,
        k: &BigUint,
        salt: &[u8],
        b_pub: &BigUint,
        password: &str,
    ) -> Result<(ClientProof, Vec<u8>, Zeroizing<Vec<u8>>)> {
        let crypto = self.crypto.as_ref();
        let n = group.modulus();
        if (b_pub % n).bits() == 0 {
            return Err(SessionError::Auth("degenerate server public value B".into()));
        }

        let a = random_exponent(crypto, group);
        let a_pub = group.generator().modpow(&a, n);
        let x = private_key(crypto, salt, &self.identity, password);
        let v = group.generator().modpow(&x, n);
        let u = BigUint::from_bytes_be(&hash(crypto, &[&group.pad(&a_pub), &group.pad(b_pub)]));
        if u.bits() == 0 {
            return Err(SessionError::Auth("degenerate scrambling parameter u".into()));
        }

        let kv = (k * &v) % n;
        let base = ((b_pub % n) + n - kv) % n;
        let s = Zeroizing::new(group.pad(&base.modpow(&(&a + &u * &x), n)));

        let m1 = hash(crypto, &[&group.pad(&a_pub), &group.pad(b_pub), &s]);
        let m2 = hash(crypto, &[&group.pad(&a_pub), &pad_to(&m1, group.len()), &s]);
        let key = Zeroizing::new(hash(crypto, &[&s]));
        Ok((ClientProof { a_pub, m1 }, m2, key))
    }
}

/// Result of a verified client proof.
#[derive(Debug)]
pub struct ServerProof {
    /// Server proof `M2`.
    pub m2: Vec<u8>,
    /// Session key `K`.
    pub key: Zeroizing<Vec<u8>>,
}

/// Server side of one SRP exchange, for verifier hosts and simulations.
pub struct SrpServer {
    crypto: Arc<dyn CryptoService>,
    group: SrpGroup,
    multiplier: BigUint,
    verifier: BigUint,
    secret: BigUint,
    b_pub: BigUint,
}

impl std::fmt::Debug for SrpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrpServer").finish_non_exhaustive()
    }
}

impl SrpServer {
    /// Start an exchange for the account holding `verifier`.
    pub fn new(crypto: Arc<dyn CryptoService>, group: SrpGroup, verifier: BigUint) -> Self {
        let multiplier = group.multiplier(crypto.as_ref());
        let secret = random_exponent(crypto.as_ref(), &group);
        let n = group.modulus();
        let b_pub = ((&multiplier * &verifier) + group.generator().modpow(&secret, n)) % n;
        Self {
            crypto,
            group,
            multiplier,
            verifier,
            secret,
            b_pub,
        }
    }

    /// Group in use.
    pub fn group(&self) -> &SrpGroup {
        &self.group
    }

    /// Public value `B`.
    pub fn public_value(&self) -> &BigUint {
        &self.b_pub
    }

    /// Multiplier `k`.
    pub fn multiplier(&self) -> &BigUint {
        &self.multiplier
    }

    /// Challenge fields `(B, N, g, k)` as wire hex.
    pub fn challenge_hex(&self) -> (String, String, String, String) {
        (
            big_hex(&self.b_pub),
            big_hex(self.group.modulus()),
            big_hex(self.group.generator()),
            big_hex(&self.multiplier),
        )
    }

    /// Check the client's `M1` and produce `M2` and `K`.
    pub fn verify_client(&self, a_pub: &BigUint, m1: &[u8]) -> Result<ServerProof> {
        let crypto = self.crypto.as_ref();
        let group = &self.group;
        let n = group.modulus();
        if (a_pub % n).bits() == 0 {
            return Err(SessionError::Auth("degenerate client public value A".into()));
        }
        let u = BigUint::from_bytes_be(&hash(crypto, &[&group.pad(a_pub), &group.pad(&self.b_pub)]));
        let base = (a_pub * self.verifier.modpow(&u, n)) % n;
        let s = Zeroizing::new(group.pad(&base.modpow(&self.secret, n)));

        let expected = hash(crypto, &[&group.pad(a_pub), &group.pad(&self.b_pub), &s]);
        if !constant_time_eq(&expected, m1) {
            return Err(SessionError::Auth("client proof M1 mismatch".into()));
        }
        Ok(ServerProof {
            m2: hash(crypto, &[&group.pad(a_pub), &pad_to(m1, group.len()), &s]),
            key: Zeroizing::new(hash(crypto, &[&s])),
        })
    }
}

/// Parse a wire hex big integer (`A`, `B`, `N`).
pub fn parse_hex_int(field: &str, hex: &str) -> Result<BigUint> {
    parse_big(field, hex)
}
