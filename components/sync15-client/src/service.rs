/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync engine. Owns the signed-in account, the storage credential
//! cache, the request queue and the registered collection managers, and
//! drives every byte that goes to or comes from the FxA and storage
//! servers.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::io::Read;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use hex;
use hyper::{Method, StatusCode};
use reqwest::{header, Client, Url};
use serde_json;

use fxa_auth::util as fxa_util;
use fxa_auth::{self, browser_id, crypto, Config, RsaKeyPair};

use bso_record::{BsoRecord, EncryptedBso};
use collection_keys::CollectionKeys;
use error::{Error, ErrorKind, Result};
use key_bundle::KeyBundle;
use manager::{ChangeKind, LocalChange, SynchronizableManager};
use record_types::{ClientRecord, MetaGlobalRecord, STORAGE_VERSION};
use records::{self, SyncRecord};
use request::{item_endpoint, CollectionRequest, XIfModifiedSince, XIfUnmodifiedSince,
              XLastModified};
use settings::{self, SettingsStore, SharedSettings};
use token::{StorageCredentials, TokenserverClient};
use util::{ServerTimestamp, SERVER_EPOCH};
use vault::SecretVault;

const SECRET_UID: &'static str = "uid";
const SECRET_SESSION_TOKEN: &'static str = "session_token";
const SECRET_MASTER_KEY: &'static str = "master_key";
const SECRET_CRYPTO_KEYS: &'static str = "crypto_keys";

const CONTENT_TYPE_JSON: &'static str = "application/json; charset=utf-8";

/// Seconds of validity claimed by a BrowserID assertion.
const ASSERTION_DURATION_SECS: u64 = 300;

/// How long to wait between /account/keys polls while the account email is
/// unverified.
const VERIFICATION_POLL_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub enum SyncSignal {
    /// The vault write after sign-in completed, successfully or not.
    SecretsStoreFinished(Option<String>),
    SignInError(String),
    SyncFinished,
}

pub struct StorageResponse {
    pub status: StatusCode,
    pub body: String,
    pub last_modified: Option<ServerTimestamp>,
}

impl StorageResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

type StorageCallback = Box<FnMut(&mut SyncService, &StorageResponse)>;

/// One queued (or in-flight) storage server request. Requests queued while
/// credentials are being refreshed drain in FIFO order.
pub struct StorageRequest {
    endpoint: String,
    method: Method,
    body: Option<String>,
    if_modified_since: Option<ServerTimestamp>,
    if_unmodified_since: Option<ServerTimestamp>,
    callback: Option<StorageCallback>,
}

impl StorageRequest {
    fn get(endpoint: String) -> StorageRequest {
        StorageRequest {
            endpoint: endpoint,
            method: Method::Get,
            body: None,
            if_modified_since: None,
            if_unmodified_since: None,
            callback: None,
        }
    }

    fn put(endpoint: String, body: String) -> StorageRequest {
        StorageRequest {
            endpoint: endpoint,
            method: Method::Put,
            body: Some(body),
            if_modified_since: None,
            if_unmodified_since: None,
            callback: None,
        }
    }

    fn delete(endpoint: String) -> StorageRequest {
        StorageRequest {
            endpoint: endpoint,
            method: Method::Delete,
            body: None,
            if_modified_since: None,
            if_unmodified_since: None,
            callback: None,
        }
    }

    fn if_unmodified_since(mut self, ts: Option<ServerTimestamp>) -> StorageRequest {
        self.if_unmodified_since = ts;
        self
    }

    fn with_callback(mut self, callback: StorageCallback) -> StorageRequest {
        self.callback = Some(callback);
        self
    }
}

struct PeriodicSync {
    interval: Duration,
    next_due: Instant,
}

pub struct SyncService {
    client: Client,
    application: String,
    user_agent: String,
    config: Config,

    account: Option<String>,
    secrets: HashMap<String, String>,
    managers: Vec<Box<SynchronizableManager>>,

    storage_credentials: Option<StorageCredentials>,
    certificate: Option<String>,
    rsa_key_pair: Option<RsaKeyPair>,

    queue: VecDeque<StorageRequest>,
    // Gates credential renewal: while a refresh runs, storage requests pile
    // up in `queue` instead of racing it.
    locked: bool,

    settings: SharedSettings,
    vault: Box<SecretVault>,

    observers: Vec<Box<Fn(&SyncSignal)>>,
    changes_tx: Sender<LocalChange>,
    changes_rx: Receiver<LocalChange>,

    periodic: Option<PeriodicSync>,
}

impl SyncService {
    pub fn new(
        application: &str,
        user_agent: &str,
        config: Config,
        settings: SharedSettings,
        vault: Box<SecretVault>,
    ) -> Result<SyncService> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let (changes_tx, changes_rx) = channel();
        let account = settings
            .borrow()
            .get_string(settings::SYNC_USER)
            .and_then(|user| if user.is_empty() { None } else { Some(user) });

        let mut service = SyncService {
            client: client,
            application: application.to_string(),
            user_agent: user_agent.to_string(),
            config: config,
            account: None,
            secrets: HashMap::new(),
            managers: Vec::new(),
            storage_credentials: None,
            certificate: None,
            rsa_key_pair: None,
            queue: VecDeque::new(),
            locked: false,
            settings: settings,
            vault: vault,
            observers: Vec::new(),
            changes_tx: changes_tx,
            changes_rx: changes_rx,
            periodic: None,
        };
        if let Some(account) = account {
            service.account = Some(account);
            service.load_secrets();
        }
        Ok(service)
    }

    #[inline]
    pub fn is_signed_in(&self) -> bool {
        self.account.is_some()
    }

    pub fn sync_user(&self) -> Option<&str> {
        self.account.as_ref().map(|account| account.as_str())
    }

    pub fn connect_signal<F>(&mut self, callback: F)
    where
        F: Fn(&SyncSignal) + 'static,
    {
        self.observers.push(Box::new(callback));
    }

    fn emit(&self, signal: SyncSignal) {
        for observer in &self.observers {
            observer(&signal);
        }
    }

    fn get_secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(|value| value.as_str())
    }

    fn set_secret(&mut self, name: &str, value: &str) {
        self.secrets.insert(name.to_string(), value.to_string());
    }

    /// The bundle for one collection, taken from the cached crypto/keys
    /// cleartext (the named collection's array, or `default`).
    fn collection_key_bundle(&self, collection: &str) -> Result<KeyBundle> {
        let crypto_keys = self.get_secret(SECRET_CRYPTO_KEYS)
            .ok_or_else(|| Error::from(ErrorKind::MissingCryptoKeys))?;
        let keys = CollectionKeys::from_cleartext_json(crypto_keys)?;
        Ok(keys.key_for_collection(collection).clone())
    }

    fn master_key_bundle(&self) -> Result<KeyBundle> {
        let master_key = self.get_secret(SECRET_MASTER_KEY)
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?;
        let kb = hex::decode(master_key)?;
        KeyBundle::from_master_key(&kb)
    }

    // ------------- Storage requests and the credentials pipeline -------------

    fn clear_storage_credentials(&mut self) {
        self.certificate = None;
        self.storage_credentials = None;
    }

    fn storage_credentials_expired(&self) -> bool {
        match self.storage_credentials {
            Some(ref credentials) => credentials.expired(fxa_util::now_secs()),
            None => true,
        }
    }

    /// If the storage credentials are valid, directly send the request.
    /// Otherwise the request remains queued, scheduled to be sent once the
    /// new credentials are obtained.
    fn queue_storage_request(&mut self, request: StorageRequest) {
        if !self.storage_credentials_expired() {
            self.send_storage_request(request);
            return;
        }

        self.queue.push_back(request);
        if !self.locked {
            // Mark as locked so other requests won't lead to conflicts while
            // obtaining new storage credentials.
            self.locked = true;
            self.clear_storage_credentials();
            self.obtain_storage_credentials();
        }
    }

    fn obtain_storage_credentials(&mut self) {
        match self.try_obtain_storage_credentials() {
            Ok(()) => {
                self.locked = false;
                self.drain_storage_queue();
            }
            Err(error) => {
                if error.is_auth_invalidated() || error.is_certificate_invalid() {
                    // New account passwords mean new tokens, and a foreign
                    // certificate means the session cannot be trusted; all we
                    // can do is sign out and ask for a fresh sign-in. The
                    // lock stays held while we do, so the requests sign-out
                    // itself queues cannot restart the refresh.
                    warn!("Unusable session ({}), signing out", error);
                    self.do_sign_out();
                    self.emit(SyncSignal::SignInError(
                        "The password of your account seems to have been changed.".to_string(),
                    ));
                } else {
                    warn!("Failed to obtain storage credentials: {}", error);
                    self.emit(SyncSignal::SignInError(
                        "Failed to obtain the storage credentials.".to_string(),
                    ));
                }
                self.locked = false;
                // Drop queued requests without invoking their callbacks.
                self.queue.clear();
            }
        }
    }

    /// The three-step chain: sign a fresh RSA public key into a certificate,
    /// turn it into a BrowserID assertion, trade the assertion at the Token
    /// Server for storage credentials.
    fn try_obtain_storage_credentials(&mut self) -> Result<()> {
        let session_token = self.get_secret(SECRET_SESSION_TOKEN)
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?
            .to_string();
        let uid = self.get_secret(SECRET_UID)
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?
            .to_string();
        let master_key = self.get_secret(SECRET_MASTER_KEY)
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?
            .to_string();

        // A new RSA key pair signs every new certificate.
        let key_pair = RsaKeyPair::generate().map_err(Error::from)?;
        let config = self.config.clone();
        let fxa = fxa_auth::Client::new(&config);
        let certificate = fxa.sign_certificate(&session_token, &key_pair)?;
        browser_id::verify_certificate(&certificate, &uid, &fxa.auth_host()?)?;

        let token_server_url = self.config.token_server_url()?;
        let audience = browser_id::audience(token_server_url.as_str())?;
        let assertion = browser_id::create_assertion(
            &certificate,
            &audience,
            ASSERTION_DURATION_SECS,
            &key_pair,
        )?;
        // The X-Client-State header lets the Token Server recognize accounts
        // that were previously used to sync Firefox data too.
        let kb = hex::decode(&master_key)?;
        let client_state = crypto::client_state(&kb);

        let tokenserver = TokenserverClient::new(token_server_url);
        let credentials = tokenserver.fetch_credentials(
            &self.client,
            &assertion,
            &client_state,
            fxa_util::now_secs(),
        )?;

        self.certificate = Some(certificate);
        self.rsa_key_pair = Some(key_pair);
        self.storage_credentials = Some(credentials);
        Ok(())
    }

    fn drain_storage_queue(&mut self) {
        while let Some(request) = self.queue.pop_front() {
            self.send_storage_request(request);
        }
    }

    fn send_storage_request(&mut self, mut request: StorageRequest) {
        let callback = request.callback.take();
        let response = match self.execute_storage_request(&request) {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    "{} request to {} failed: {}",
                    request.method, request.endpoint, error
                );
                // Best-effort empty success so chained callbacks can unwind
                // gracefully.
                StorageResponse {
                    status: StatusCode::Ok,
                    body: String::new(),
                    last_modified: None,
                }
            }
        };
        if let Some(mut callback) = callback {
            callback(self, &response);
        }
    }

    fn execute_storage_request(&self, request: &StorageRequest) -> Result<StorageResponse> {
        let credentials = self.storage_credentials
            .as_ref()
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?;
        let url = format!("{}/{}", credentials.api_endpoint, request.endpoint);

        let hawk_options = request
            .body
            .as_ref()
            .map(|body| fxa_auth::hawk::Options::with_payload(body, CONTENT_TYPE_JSON));
        let method = format!("{}", request.method);
        let hawk_header = fxa_auth::hawk::header(
            &url,
            &method,
            &credentials.key_id,
            credentials.key.as_bytes(),
            hawk_options,
        )?;

        let mut req = self.client
            .request(request.method.clone(), Url::parse(&url)?)
            .header(header::Authorization(hawk_header.value))
            .header(header::UserAgent::new(self.user_agent.clone()))
            .build()?;
        if request.method == Method::Put {
            req.headers_mut().set_raw("content-type", CONTENT_TYPE_JSON);
        }
        if let Some(ts) = request.if_modified_since {
            req.headers_mut().set(XIfModifiedSince(ts));
        }
        if let Some(ts) = request.if_unmodified_since {
            req.headers_mut().set(XIfUnmodifiedSince(ts));
        }
        if let Some(ref body) = request.body {
            *req.body_mut() = Some(body.clone().into());
        }

        let mut resp = self.client.execute(req)?;
        let status = resp.status();
        let last_modified = resp.headers().get::<XLastModified>().map(|h| **h);
        let mut body = String::new();
        resp.read_to_string(&mut body)?;

        if !status.is_success() {
            debug!(
                "HTTP status {} during a storage request to {}",
                status, request.endpoint
            );
        }

        Ok(StorageResponse {
            status: status,
            body: body,
            last_modified: last_modified,
        })
    }

    // ------------------------------- Sign-in -------------------------------

    /// Conclude an FxA web sign-in: fetch and unwrap the sync keys, verify
    /// the server storage, cache crypto/keys and persist everything to the
    /// vault.
    pub fn do_sign_in(
        &mut self,
        email: &str,
        uid: &str,
        session_token: &str,
        key_fetch_token: &str,
        unwrap_b_key: &str,
    ) {
        if self.is_signed_in() {
            warn!("Already signed in, ignoring sign-in request");
            return;
        }

        // Get the master sync key bundle from the /account/keys endpoint,
        // polling while the account email is not verified yet.
        let bundle = {
            let config = self.config.clone();
            let fxa = fxa_auth::Client::new(&config);
            loop {
                match fxa.account_keys(key_fetch_token) {
                    Ok(bundle) => break bundle,
                    Err(ref error) if error.is_not_verified() => {
                        info!("Account not verified, retrying...");
                        thread::sleep(Duration::from_secs(VERIFICATION_POLL_SECS));
                    }
                    Err(error) => {
                        warn!("Failed to get /account/keys: {}", error);
                        self.report_sign_in_error(
                            "Failed to retrieve the Sync Key.",
                            Some(session_token),
                            false,
                        );
                        return;
                    }
                }
            }
        };

        let master_keys = crypto::derive_key_fetch_token(key_fetch_token)
            .and_then(|keys| {
                let unwrap_kb = hex::decode(unwrap_b_key)?;
                crypto::derive_master_keys(
                    &bundle,
                    &keys.resp_hmac_key,
                    &keys.resp_xor_key,
                    &unwrap_kb,
                )
            });
        let (_ka, kb) = match master_keys {
            Ok(keys) => keys,
            Err(error) => {
                warn!("Failed to derive the master keys: {}", error);
                self.report_sign_in_error(
                    "Failed to retrieve the Sync Key.",
                    Some(session_token),
                    false,
                );
                return;
            }
        };

        // Save email and tokens, then make sure the server side is usable.
        self.account = Some(email.to_string());
        let kb_hex = hex::encode(&kb);
        self.set_secret(SECRET_UID, uid);
        self.set_secret(SECRET_SESSION_TOKEN, session_token);
        self.set_secret(SECRET_MASTER_KEY, &kb_hex);

        self.check_storage_version();
    }

    fn report_sign_in_error(
        &mut self,
        message: &str,
        session_token: Option<&str>,
        clear_secrets: bool,
    ) {
        self.emit(SyncSignal::SignInError(message.to_string()));
        self.destroy_session(session_token);
        if clear_secrets {
            self.account = None;
            self.secrets.clear();
        }
    }

    fn destroy_session(&mut self, session_token: Option<&str>) {
        let token = match session_token {
            Some(token) => Some(token.to_string()),
            None => self.get_secret(SECRET_SESSION_TOKEN).map(String::from),
        };
        let token = match token {
            Some(token) => token,
            None => return,
        };
        let config = self.config.clone();
        let fxa = fxa_auth::Client::new(&config);
        match fxa.destroy_session(&token) {
            Ok(()) => debug!("Successfully destroyed session"),
            Err(error) => warn!("Failed to destroy session: {}", error),
        }
    }

    fn check_storage_version(&mut self) {
        let request = StorageRequest::get("storage/meta/global".to_string()).with_callback(
            Box::new(|service, response| service.check_storage_version_cb(response)),
        );
        self.queue_storage_request(request);
    }

    fn check_storage_version_cb(&mut self, response: &StorageResponse) {
        if response.status == StatusCode::NotFound {
            // First-time setup: upload a fresh meta/global and move on.
            self.upload_meta_global();
            self.obtain_crypto_keys();
            return;
        }
        if !response.is_success() {
            warn!(
                "Failed to get meta/global record. Status code: {}, response: {}",
                response.status, response.body
            );
            self.report_sign_in_error("Failed to verify storage version.", None, true);
            return;
        }

        match parse_storage_version(&response.body) {
            Ok(version) if version == STORAGE_VERSION => self.obtain_crypto_keys(),
            Ok(version) => {
                let message = format!(
                    "Your account uses storage version {} which this client does not \
                     support. Create a new account to use the latest storage version.",
                    version
                );
                self.report_sign_in_error(&message, None, true);
            }
            Err(error) => {
                warn!("Malformed meta/global record: {}", error);
                self.report_sign_in_error("Failed to verify storage version.", None, true);
            }
        }
    }

    fn upload_meta_global(&mut self) {
        let record = match MetaGlobalRecord::fresh() {
            Ok(record) => record,
            Err(error) => {
                warn!("Failed to generate meta/global record: {}", error);
                return;
            }
        };
        // meta/global is not encrypted!
        let bso = BsoRecord::new("global".to_string(), record);
        match serde_json::to_string(&bso) {
            Ok(body) => self.queue_storage_request(StorageRequest::put(
                "storage/meta/global".to_string(),
                body,
            )),
            Err(error) => warn!("Failed to serialize meta/global record: {}", error),
        }
    }

    fn obtain_crypto_keys(&mut self) {
        let request = StorageRequest::get("storage/crypto/keys".to_string()).with_callback(
            Box::new(|service, response| service.obtain_crypto_keys_cb(response)),
        );
        self.queue_storage_request(request);
    }

    fn obtain_crypto_keys_cb(&mut self, response: &StorageResponse) {
        let crypto_keys = if response.status == StatusCode::NotFound {
            // No keys on the server yet: generate a default bundle, upload
            // it, and proceed as if we had just decrypted it.
            self.upload_crypto_keys()
        } else if response.is_success() {
            self.decrypt_crypto_keys(&response.body)
        } else {
            warn!(
                "Failed to get crypto/keys record. Status code: {}, response: {}",
                response.status, response.body
            );
            self.report_sign_in_error("Failed to retrieve crypto keys.", None, true);
            return;
        };

        match crypto_keys {
            Ok(cleartext) => {
                self.set_secret(SECRET_CRYPTO_KEYS, &cleartext);
                self.store_secrets();
            }
            Err(error) => {
                warn!("Failed to obtain crypto keys: {}", error);
                self.report_sign_in_error("Failed to retrieve crypto keys.", None, true);
            }
        }
    }

    fn decrypt_crypto_keys(&self, body: &str) -> Result<String> {
        let bso: EncryptedBso = serde_json::from_str(body)?;
        let root_key = self.master_key_bundle()?;
        let cleartext = bso.payload.decrypt(&root_key)?;
        // Make sure the payload has the expected shape before caching it.
        CollectionKeys::from_cleartext_json(&cleartext)?;
        Ok(cleartext)
    }

    fn upload_crypto_keys(&mut self) -> Result<String> {
        let keys = CollectionKeys::new_random()?;
        let root_key = self.master_key_bundle()?;
        let payload = keys.to_encrypted_payload(&root_key)?;
        let bso = EncryptedBso::new("keys".to_string(), payload);
        let body = serde_json::to_string(&bso)?;
        self.queue_storage_request(StorageRequest::put(
            "storage/crypto/keys".to_string(),
            body,
        ));
        keys.to_cleartext_json()
    }

    fn store_secrets(&mut self) {
        let account = match self.account.clone() {
            Some(account) => account,
            None => return,
        };
        let result = serde_json::to_string(&self.secrets)
            .map_err(Error::from)
            .and_then(|json| self.vault.store(&account, &json));
        match result {
            Ok(()) => {
                self.settings
                    .borrow_mut()
                    .set_string(settings::SYNC_USER, &account);
                self.register_client_id();
                self.emit(SyncSignal::SecretsStoreFinished(None));
            }
            Err(error) => {
                warn!("Failed to store sync secrets: {}", error);
                self.destroy_session(None);
                self.account = None;
                self.secrets.clear();
                self.emit(SyncSignal::SecretsStoreFinished(Some(error.to_string())));
            }
        }
    }

    fn load_secrets(&mut self) {
        let account = match self.account.clone() {
            Some(account) => account,
            None => return,
        };
        let message = match self.vault.load(&account) {
            Ok(Some(json)) => match serde_json::from_str::<HashMap<String, String>>(&json) {
                Ok(secrets) => {
                    self.secrets = secrets;
                    return;
                }
                Err(error) => {
                    warn!("Sync secrets are not a valid JSON: {}", error);
                    "The sync secrets for the current sync user are invalid."
                }
            },
            Ok(None) => "Could not find the sync secrets for the current sync user.",
            Err(error) => {
                warn!("Failed to search for sync secrets: {}", error);
                "Could not find the sync secrets for the current sync user."
            }
        };
        self.emit(SyncSignal::SignInError(message.to_string()));
    }

    // -------------------------- Client registration --------------------------

    fn register_client_id(&mut self) {
        if let Err(error) = self.try_register_client_id() {
            warn!("Failed to register client record: {}", error);
        }
    }

    fn try_register_client_id(&mut self) -> Result<()> {
        let client_id = crypto::random_sync_id()?;
        let uid = self.get_secret(SECRET_UID)
            .ok_or_else(|| Error::from(ErrorKind::NotSignedIn))?
            .to_string();
        let record = ClientRecord::new(&client_id, &self.application, env::consts::OS, &uid);
        let bundle = self.collection_key_bundle("clients")?;
        let bso = records_to_client_bso(&record, &client_id, &bundle)?;
        let body = serde_json::to_string(&bso)?;
        self.queue_storage_request(StorageRequest::put(
            item_endpoint("clients", &client_id),
            body,
        ));
        self.settings
            .borrow_mut()
            .set_string(settings::SYNC_CLIENT_ID, &client_id);
        Ok(())
    }

    fn unregister_client_id(&mut self) {
        let client_id = self.settings
            .borrow()
            .get_string(settings::SYNC_CLIENT_ID)
            .unwrap_or_default();
        if client_id.is_empty() {
            return;
        }
        self.queue_storage_request(StorageRequest::delete(item_endpoint("clients", &client_id)));
        self.settings
            .borrow_mut()
            .set_string(settings::SYNC_CLIENT_ID, "");
    }

    // ------------------------------ Sync proper ------------------------------

    /// One full pass over every registered collection. `sync-finished` fires
    /// when the last one is done.
    pub fn do_sync(&mut self) {
        if !self.is_signed_in() {
            return;
        }
        self.process_local_changes();
        if self.managers.is_empty() {
            self.emit(SyncSignal::SyncFinished);
            return;
        }
        let count = self.managers.len();
        for index in 0..count {
            self.sync_collection(index, index + 1 == count);
        }
    }

    fn sync_collection(&mut self, index: usize, is_last: bool) {
        let (collection, is_initial, sync_time) = {
            let manager = &self.managers[index];
            (
                manager.collection_name(),
                manager.is_initial_sync(),
                manager.sync_time(),
            )
        };

        let collection_request = if is_initial {
            CollectionRequest::new(collection.clone()).full()
        } else {
            CollectionRequest::new(collection.clone())
                .newer_than(sync_time)
                .full()
        };

        info!(
            "Syncing {} collection {}...",
            collection,
            if is_initial { "initial" } else { "regular" }
        );
        let request = StorageRequest::get(collection_request.relative_url()).with_callback(
            Box::new(move |service, response| {
                service.sync_collection_cb(index, is_initial, is_last, response)
            }),
        );
        self.queue_storage_request(request);
    }

    fn sync_collection_cb(
        &mut self,
        index: usize,
        is_initial: bool,
        is_last: bool,
        response: &StorageResponse,
    ) {
        let collection = self.managers[index].collection_name();

        if !response.is_success() {
            warn!(
                "Failed to get records in collection {}. Status code: {}, response: {}",
                collection, response.status, response.body
            );
            if is_last {
                self.emit(SyncSignal::SyncFinished);
            }
            return;
        }

        let (remotes_deleted, remotes_updated) = match self.parse_collection(index, &response.body)
        {
            Ok(partitioned) => partitioned,
            Err(error) => {
                warn!("Failed to parse {} collection: {}", collection, error);
                if is_last {
                    self.emit(SyncSignal::SyncFinished);
                }
                return;
            }
        };

        info!(
            "Found {} deleted and {} new/updated records in {} collection",
            remotes_deleted.len(),
            remotes_updated.len(),
            collection
        );

        let to_upload = {
            let manager = &mut self.managers[index];
            // Update sync time before merging; the next regular sync only
            // wants newer records.
            if let Some(last_modified) = response.last_modified {
                manager.set_sync_time(last_modified);
            }
            manager.set_is_initial_sync(false);
            manager.merge(is_initial, remotes_deleted, remotes_updated)
        };

        for record in to_upload {
            self.upload_record(index, record);
        }

        if is_last {
            self.emit(SyncSignal::SyncFinished);
        }
    }

    fn parse_collection(
        &self,
        index: usize,
        body: &str,
    ) -> Result<(Vec<SyncRecord>, Vec<SyncRecord>)> {
        let record_type = self.managers[index].record_type();
        let collection = self.managers[index].collection_name();
        let bundle = self.collection_key_bundle(&collection)?;
        let bsos: Vec<EncryptedBso> = serde_json::from_str(body)?;

        let mut remotes_deleted = Vec::new();
        let mut remotes_updated = Vec::new();
        for bso in bsos {
            match records::from_bso(bso, record_type, &bundle) {
                Ok((record, true)) => remotes_deleted.push(record),
                Ok((record, false)) => remotes_updated.push(record),
                // A record we cannot make sense of is skipped, not fatal.
                Err(error) => warn!("Failed to create record from BSO, skipping: {}", error),
            }
        }
        Ok((remotes_deleted, remotes_updated))
    }

    // ------------------------- Single-record flows -------------------------

    fn upload_record(&mut self, index: usize, record: SyncRecord) {
        let collection = self.managers[index].collection_name();
        let body = match self.collection_key_bundle(&collection)
            .and_then(|bundle| records::to_bso(&record, &bundle))
            .and_then(|bso| serde_json::to_string(&bso).map_err(Error::from))
        {
            Ok(body) => body,
            Err(error) => {
                warn!("Failed to encrypt record {}: {}", record.id(), error);
                return;
            }
        };

        let server_time_modified = record.server_time_modified();
        let if_unmodified_since = if server_time_modified > SERVER_EPOCH {
            Some(server_time_modified)
        } else {
            None
        };

        debug!("Uploading record {} to {}...", record.id(), collection);
        let endpoint = item_endpoint(&collection, record.id());
        let request = StorageRequest::put(endpoint, body)
            .if_unmodified_since(if_unmodified_since)
            .with_callback(Box::new(move |service, response| {
                if response.status == StatusCode::PreconditionFailed {
                    // The server holds a newer version of this record;
                    // download it and overwrite the local state.
                    debug!("Found a newer version on the server, downloading it...");
                    service.download_record(index, record.clone());
                } else if response.is_success() {
                    let mut record = record.clone();
                    let time_modified: f64 = response.body.trim().parse().unwrap_or(0.0);
                    record.set_server_time_modified(ServerTimestamp(time_modified));
                    service.managers[index].save(&record);
                } else {
                    warn!(
                        "Failed to upload record. Status code: {}, response: {}",
                        response.status, response.body
                    );
                }
            }));
        self.queue_storage_request(request);
    }

    fn download_record(&mut self, index: usize, record: SyncRecord) {
        let collection = self.managers[index].collection_name();
        let endpoint = item_endpoint(&collection, record.id());

        debug!("Downloading record {}...", record.id());
        let request =
            StorageRequest::get(endpoint).with_callback(Box::new(move |service, response| {
                if !response.is_success() {
                    warn!(
                        "Failed to download record. Status code: {}, response: {}",
                        response.status, response.body
                    );
                    return;
                }
                match service.record_from_item_body(index, &response.body) {
                    Ok((remote, deleted)) => {
                        // Delete the local record and add the remote one,
                        // unless the newer version was itself a deletion.
                        service.managers[index].remove(&record);
                        if !deleted {
                            service.managers[index].add(remote);
                        }
                    }
                    Err(error) => warn!("Failed to parse downloaded record: {}", error),
                }
            }));
        self.queue_storage_request(request);
    }

    fn record_from_item_body(&self, index: usize, body: &str) -> Result<(SyncRecord, bool)> {
        let record_type = self.managers[index].record_type();
        let collection = self.managers[index].collection_name();
        let bundle = self.collection_key_bundle(&collection)?;
        let bso: EncryptedBso = serde_json::from_str(body)?;
        records::from_bso(bso, record_type, &bundle)
    }

    fn delete_record(&mut self, index: usize, record: SyncRecord) {
        let collection = self.managers[index].collection_name();
        let body = match self.collection_key_bundle(&collection)
            .and_then(|bundle| records::tombstone_bso(record.id(), &bundle))
            .and_then(|bso| serde_json::to_string(&bso).map_err(Error::from))
        {
            Ok(body) => body,
            Err(error) => {
                warn!("Failed to encrypt tombstone for {}: {}", record.id(), error);
                return;
            }
        };

        debug!("Deleting record {} from {}...", record.id(), collection);
        let endpoint = item_endpoint(&collection, record.id());
        let request = StorageRequest::put(endpoint, body).with_callback(Box::new(
            |_service, response: &StorageResponse| {
                if response.is_success() {
                    debug!("Successfully deleted from server");
                } else {
                    warn!(
                        "Failed to delete record. Status code: {}, response: {}",
                        response.status, response.body
                    );
                }
            },
        ));
        self.queue_storage_request(request);
    }

    // -------------------------- Managers and signals --------------------------

    pub fn register_manager(&mut self, mut manager: Box<SynchronizableManager>) {
        manager.connect_changes(self.changes_tx.clone());
        self.managers.push(manager);
    }

    pub fn unregister_manager(&mut self, collection: &str) -> Option<Box<SynchronizableManager>> {
        let position = self.managers
            .iter()
            .position(|manager| manager.collection_name() == collection)?;
        let mut manager = self.managers.remove(position);
        manager.disconnect_changes();
        Some(manager)
    }

    /// Drain the change notifications managers queued up and turn them into
    /// uploads and deletions. Changes reported while signed out are dropped.
    pub fn process_local_changes(&mut self) {
        loop {
            let change: LocalChange = match self.changes_rx.try_recv() {
                Ok(change) => change,
                Err(_) => break,
            };
            if !self.is_signed_in() {
                continue;
            }
            let index = match self.managers
                .iter()
                .position(|manager| manager.collection_name() == change.collection)
            {
                Some(index) => index,
                None => continue,
            };
            match change.kind {
                ChangeKind::Modified => self.upload_record(index, change.record),
                ChangeKind::Deleted => self.delete_record(index, change.record),
            }
        }
    }

    // ------------------------------- Sign-out -------------------------------

    pub fn do_sign_out(&mut self) {
        if !self.is_signed_in() {
            return;
        }

        let collections: Vec<String> = self.managers
            .iter()
            .map(|manager| manager.collection_name())
            .collect();

        self.unregister_client_id();
        self.stop_periodical_sync();
        self.destroy_session(None);
        self.clear_storage_credentials();
        self.rsa_key_pair = None;

        if let Some(account) = self.account.take() {
            if let Err(error) = self.vault.clear(&account) {
                warn!("Failed to clear sync secrets: {}", error);
            }
        }
        self.secrets.clear();

        // Queued requests die with the session; their callbacks never run.
        self.queue.clear();
        self.locked = false;

        for manager in &mut self.managers {
            manager.disconnect_changes();
        }
        self.managers.clear();
        while self.changes_rx.try_recv().is_ok() {}

        let mut store = self.settings.borrow_mut();
        store.set_string(settings::SYNC_USER, "");
        for collection in collections {
            store.set_bool(&settings::is_initial_key(&collection), true);
        }
    }

    // ----------------------------- Periodic sync -----------------------------

    pub fn start_periodical_sync(&mut self) {
        if !self.is_signed_in() {
            return;
        }
        self.do_sync();
        self.schedule_periodical_sync();
    }

    pub fn stop_periodical_sync(&mut self) {
        self.periodic = None;
    }

    /// Call when the `sync.frequency` setting changed; the running schedule
    /// restarts with the new interval.
    pub fn sync_frequency_changed(&mut self) {
        if self.periodic.is_some() {
            self.schedule_periodical_sync();
        }
    }

    fn schedule_periodical_sync(&mut self) {
        let minutes = self.settings
            .borrow()
            .get_uint(settings::SYNC_FREQUENCY)
            .unwrap_or(settings::DEFAULT_SYNC_FREQUENCY_MINUTES);
        let interval = Duration::from_secs(minutes * 60);
        self.periodic = Some(PeriodicSync {
            interval: interval,
            next_due: Instant::now() + interval,
        });
        debug!("Scheduled new sync with frequency {} minutes", minutes);
    }

    /// The embedder's event loop calls this regularly; it pumps manager
    /// change notifications and runs the periodic sync when due.
    pub fn tick(&mut self) {
        self.process_local_changes();
        let due = match self.periodic {
            Some(ref periodic) => Instant::now() >= periodic.next_due,
            None => false,
        };
        if due {
            self.do_sync();
            if let Some(ref mut periodic) = self.periodic {
                periodic.next_due = Instant::now() + periodic.interval;
            }
        }
    }
}

fn parse_storage_version(body: &str) -> Result<i64> {
    let bso: serde_json::Value = serde_json::from_str(body)?;
    let payload = bso["payload"]
        .as_str()
        .ok_or_else(|| ::error::unexpected("meta/global has no payload"))?;
    let meta: serde_json::Value = serde_json::from_str(payload)?;
    meta["storageVersion"]
        .as_i64()
        .ok_or_else(|| ::error::unexpected("meta/global has no storageVersion"))
}

fn records_to_client_bso(
    record: &ClientRecord,
    client_id: &str,
    bundle: &KeyBundle,
) -> Result<EncryptedBso> {
    let cleartext = serde_json::to_string(record)?;
    let payload = ::bso_record::EncryptedPayload::from_cleartext(&cleartext, bundle)?;
    Ok(EncryptedBso::new(client_id.to_string(), payload))
}
