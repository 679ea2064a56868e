//! Software HSM for development and tests
//!
//! Key material is wrapped with AES-256-GCM under a device key that never
//! leaves this struct. Signing keys are Ed25519 seeds, derivations are
//! SHA-256 over the unwrapped secret and the caller input.

use super::blob::BlobType;
use super::client::{Credential, HsmClient, NativeHandle, VendorError, VendorResult};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_chacha::rand_core::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const AES_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SECRET_SIZE: usize = 32;
const TOKEN_SIZE: usize = 32;

pub const CODE_SESSION_EXPIRED: u32 = 0xB101_0011;
pub const CODE_SESSION_BROKEN: u32 = 0xB101_0012;
pub const CODE_INVALID_TOKEN: u32 = 0xB101_0021;
pub const CODE_INVALID_BLOB: u32 = 0xB101_0022;
pub const CODE_NOT_LOGGED_ON: u32 = 0xB101_0031;
pub const CODE_INJECTED_FAILURE: u32 = 0xB101_00FF;

#[derive(Zeroize, ZeroizeOnDrop)]
struct DeviceKey {
    bytes: [u8; AES_KEY_SIZE],
}

#[derive(Debug, Default)]
struct HandleState {
    user: Option<String>,
    expired: bool,
    broken: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_handle: u64,
    handles: HashMap<u64, HandleState>,
    tokens: HashSet<Vec<u8>>,
    fail_connect: bool,
    reject_logon: bool,
    fail_tee_token: bool,
    connect_delay: Duration,
    keep_alive_delay: Duration,
    connects: u64,
    disconnects: u64,
}

/// Simulated HSM device
pub struct SimulatedHsmClient {
    device_key: DeviceKey,
    state: Mutex<DeviceState>,
}

impl Default for SimulatedHsmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHsmClient {
    /// Create a device with a random device key
    pub fn new() -> Self {
        let mut bytes = [0u8; AES_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self::with_device_key(bytes)
    }

    /// Create a device with a fixed device key, so wrapped blobs survive restarts
    pub fn with_device_key(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self {
            device_key: DeviceKey { bytes },
            state: Mutex::new(DeviceState {
                next_handle: 1,
                ..DeviceState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        // Device state stays consistent across a panicking caller
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Fault injection

    /// Make every following `connect` fail until reset
    pub fn set_fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Make every following `logon` fail until reset
    pub fn set_reject_logon(&self, reject: bool) {
        self.state().reject_logon = reject;
    }

    /// Block every following `connect` for `delay`, like a slow network
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Block every following keep-alive ping for `delay`
    pub fn set_keep_alive_delay(&self, delay: Duration) {
        self.state().keep_alive_delay = delay;
    }

    /// Make every following TEE token request fail until reset
    pub fn set_fail_tee_token(&self, fail: bool) {
        self.state().fail_tee_token = fail;
    }

    /// Expire every open handle, as the device does after a restart
    pub fn expire_all_handles(&self) {
        for handle in self.state().handles.values_mut() {
            handle.expired = true;
        }
    }

    /// Break a single handle
    pub fn break_handle(&self, handle: NativeHandle) {
        if let Some(state) = self.state().handles.get_mut(&handle.0) {
            state.broken = true;
        }
    }

    // Counters

    pub fn connect_count(&self) -> u64 {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> u64 {
        self.state().disconnects
    }

    pub fn open_handle_count(&self) -> usize {
        self.state().handles.len()
    }

    // Provisioning

    /// Create wrapped key material for a blob type, as an enrolment would
    pub fn provision(&self, blob_type: BlobType) -> VendorResult<Vec<u8>> {
        match blob_type {
            BlobType::TeeToken => Err(VendorError::Operation {
                operation: "provision",
                code: CODE_INVALID_BLOB,
            }),
            _ => {
                let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
                OsRng.fill_bytes(&mut secret[..]);
                self.wrap("provision", &secret[..])
            }
        }
    }

    /// Public half of a wrapped signing key
    pub fn verifying_key(&self, key_blob: &[u8]) -> VendorResult<VerifyingKey> {
        Ok(self.signing_key("verifying_key", key_blob)?.verifying_key())
    }

    fn wrap(&self, operation: &'static str, plaintext: &[u8]) -> VendorResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.device_key.bytes).map_err(|_| {
            VendorError::Operation {
                operation,
                code: CODE_INVALID_BLOB,
            }
        })?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VendorError::Operation {
                operation,
                code: CODE_INVALID_BLOB,
            })?;

        let mut wrapped = nonce_bytes.to_vec();
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap(&self, operation: &'static str, wrapped: &[u8]) -> VendorResult<Zeroizing<Vec<u8>>> {
        let invalid = VendorError::Operation {
            operation,
            code: CODE_INVALID_BLOB,
        };
        if wrapped.len() <= NONCE_SIZE {
            return Err(invalid);
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(&self.device_key.bytes).map_err(|_| invalid.clone())?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| invalid)
    }

    fn signing_key(&self, operation: &'static str, key_blob: &[u8]) -> VendorResult<SigningKey> {
        let seed = self.unwrap(operation, key_blob)?;
        let seed: [u8; SECRET_SIZE] = seed.as_slice().try_into().map_err(|_| VendorError::Operation {
            operation,
            code: CODE_INVALID_BLOB,
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Validate that a handle is usable for `operation`
    fn check(&self, handle: NativeHandle, operation: &'static str) -> VendorResult<()> {
        let state = self.state();
        match state.handles.get(&handle.0) {
            None => Err(VendorError::SessionBroken {
                code: CODE_SESSION_BROKEN,
            }),
            Some(h) if h.broken => Err(VendorError::SessionBroken {
                code: CODE_SESSION_BROKEN,
            }),
            Some(h) if h.expired => Err(VendorError::SessionExpired {
                code: CODE_SESSION_EXPIRED,
            }),
            Some(h) if h.user.is_none() => Err(VendorError::Operation {
                operation,
                code: CODE_NOT_LOGGED_ON,
            }),
            Some(_) => Ok(()),
        }
    }

    fn check_with_token(&self, handle: NativeHandle, operation: &'static str, tee_token: &[u8]) -> VendorResult<()> {
        self.check(handle, operation)?;
        if self.state().tokens.contains(tee_token) {
            Ok(())
        } else {
            Err(VendorError::Operation {
                operation,
                code: CODE_INVALID_TOKEN,
            })
        }
    }
}

impl HsmClient for SimulatedHsmClient {
    fn connect(&self, device: &str) -> VendorResult<NativeHandle> {
        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        if state.fail_connect {
            return Err(VendorError::ConnectFailed(format!("device {} unreachable", device)));
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, HandleState::default());
        state.connects += 1;
        debug!(handle = handle, device = %device, "Simulated HSM connection opened");
        Ok(NativeHandle(handle))
    }

    fn logon(&self, handle: NativeHandle, username: &str, credential: Credential<'_>) -> VendorResult<()> {
        let mut state = self.state();
        let secret_empty = match credential {
            Credential::Password(p) => p.is_empty(),
            Credential::Keyspec(k) => k.is_empty(),
        };
        if state.reject_logon || secret_empty {
            return Err(VendorError::LogonRejected {
                username: username.to_string(),
            });
        }

        match state.handles.get_mut(&handle.0) {
            Some(h) => {
                h.user = Some(username.to_string());
                Ok(())
            }
            None => Err(VendorError::SessionBroken {
                code: CODE_SESSION_BROKEN,
            }),
        }
    }

    fn disconnect(&self, handle: NativeHandle) {
        let mut state = self.state();
        if state.handles.remove(&handle.0).is_some() {
            state.disconnects += 1;
            debug!(handle = handle.0, "Simulated HSM connection closed");
        }
    }

    fn keep_alive(&self, handle: NativeHandle) -> VendorResult<()> {
        let delay = self.state().keep_alive_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.check(handle, "keep_alive")
    }

    fn tee_token(&self, handle: NativeHandle) -> VendorResult<Vec<u8>> {
        self.check(handle, "tee_token")?;

        let mut state = self.state();
        if state.fail_tee_token {
            return Err(VendorError::Operation {
                operation: "tee_token",
                code: CODE_INJECTED_FAILURE,
            });
        }

        let mut token = vec![0u8; TOKEN_SIZE];
        OsRng.fill_bytes(&mut token);
        state.tokens.insert(token.clone());
        Ok(token)
    }

    fn derive_key(
        &self,
        handle: NativeHandle,
        tee_token: &[u8],
        derivation_blob: &[u8],
        input: &[u8],
    ) -> VendorResult<Vec<u8>> {
        self.check_with_token(handle, "derive_key", tee_token)?;
        let secret = self.unwrap("derive_key", derivation_blob)?;

        let mut hasher = Sha256::new();
        hasher.update(secret.as_slice());
        hasher.update(input);
        Ok(hasher.finalize().to_vec())
    }

    fn sign(&self, handle: NativeHandle, tee_token: &[u8], key_blob: &[u8], data: &[u8]) -> VendorResult<Vec<u8>> {
        self.check_with_token(handle, "sign", tee_token)?;
        let key = self.signing_key("sign", key_blob)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    fn random_bytes(&self, handle: NativeHandle, count: usize) -> VendorResult<Vec<u8>> {
        self.check(handle, "random_bytes")?;
        let mut bytes = vec![0u8; count];
        OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn generate_wrapped_key(&self, handle: NativeHandle, tee_token: &[u8]) -> VendorResult<Vec<u8>> {
        self.check_with_token(handle, "generate_wrapped_key", tee_token)?;
        let mut key = Zeroizing::new([0u8; SECRET_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        self.wrap("generate_wrapped_key", &key[..])
    }

    fn unwrap_key(&self, handle: NativeHandle, tee_token: &[u8], wrapped: &[u8]) -> VendorResult<Vec<u8>> {
        self.check_with_token(handle, "unwrap_key", tee_token)?;
        let key = self.unwrap("unwrap_key", wrapped)?;
        Ok(key.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn logged_on(client: &SimulatedHsmClient) -> NativeHandle {
        let handle = client.connect("simulated").unwrap();
        client
            .logon(handle, "ERP_WORK", Credential::Password("password"))
            .unwrap();
        handle
    }

    #[test]
    fn test_connect_and_disconnect_counts() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);
        assert_eq!(client.open_handle_count(), 1);

        client.disconnect(handle);
        client.disconnect(handle);
        assert_eq!(client.connect_count(), 1);
        assert_eq!(client.disconnect_count(), 1);
        assert_eq!(client.open_handle_count(), 0);
    }

    #[test]
    fn test_operations_require_logon() {
        let client = SimulatedHsmClient::new();
        let handle = client.connect("simulated").unwrap();

        let result = client.random_bytes(handle, 4);
        assert!(matches!(
            result,
            Err(VendorError::Operation { code: CODE_NOT_LOGGED_ON, .. })
        ));
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);
        let token = client.tee_token(handle).unwrap();
        let key_blob = client.provision(BlobType::VauSig).unwrap();

        let signature = client.sign(handle, &token, &key_blob, b"payload").unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        let verifying_key = client.verifying_key(&key_blob).unwrap();
        assert!(verifying_key.verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn test_derivation_is_deterministic_per_blob() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);
        let token = client.tee_token(handle).unwrap();
        let blob_a = client.provision(BlobType::TaskKeyDerivation).unwrap();
        let blob_b = client.provision(BlobType::TaskKeyDerivation).unwrap();

        let a1 = client.derive_key(handle, &token, &blob_a, b"task-1").unwrap();
        let a2 = client.derive_key(handle, &token, &blob_a, b"task-1").unwrap();
        let b1 = client.derive_key(handle, &token, &blob_b, b"task-1").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b1);
        assert_eq!(a1.len(), 32);
    }

    #[test]
    fn test_unknown_token_rejected() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);
        let result = client.generate_wrapped_key(handle, b"forged");
        assert!(matches!(
            result,
            Err(VendorError::Operation { code: CODE_INVALID_TOKEN, .. })
        ));
    }

    #[test]
    fn test_wrapped_key_round_trip() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);
        let token = client.tee_token(handle).unwrap();

        let wrapped = client.generate_wrapped_key(handle, &token).unwrap();
        let key = client.unwrap_key(handle, &token, &wrapped).unwrap();
        assert_eq!(key.len(), 32);
        assert_ne!(wrapped[NONCE_SIZE..].to_vec(), key);

        // Another device cannot unwrap it
        let other = SimulatedHsmClient::new();
        assert!(other.unwrap("unwrap_key", &wrapped).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let client = SimulatedHsmClient::new();
        let handle = logged_on(&client);

        client.expire_all_handles();
        assert!(matches!(
            client.keep_alive(handle),
            Err(VendorError::SessionExpired { .. })
        ));

        let second = logged_on(&client);
        client.break_handle(second);
        assert!(matches!(
            client.random_bytes(second, 1),
            Err(VendorError::SessionBroken { .. })
        ));

        client.set_reject_logon(true);
        let third = client.connect("simulated").unwrap();
        assert!(matches!(
            client.logon(third, "ERP_WORK", Credential::Password("password")),
            Err(VendorError::LogonRejected { .. })
        ));

        client.set_fail_connect(true);
        assert!(matches!(
            client.connect("simulated"),
            Err(VendorError::ConnectFailed(_))
        ));
    }
}
