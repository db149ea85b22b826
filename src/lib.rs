//! Local-first "spending plan" workbook.
//!
//! The workbook is imported from a spreadsheet file, edited through four
//! logical fields (date, end-of-day balance, allowance, comment) that the
//! user maps onto real columns, and persisted in a small key-value store
//! on disk. Two deployment modes exist: passcode-encrypted (AES-256-GCM
//! with a PBKDF2-derived key) and plaintext.
//!
//! State model:
//!
//! ```text
//! state = {
//!   version: 1,
//!   workbookName: "",
//!   sheets: {
//!     [sheetName]: {
//!       columns: [colA, colB, ...],
//!       rows: [{colA: value, colB: value, ...}, ...],
//!       mapping: { date: "Date", eod: "Balance", allow: "Allowance", comment: "Comment" }
//!     }
//!   }
//! }
//! ```

use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use calamine::{open_workbook_auto, Data, Reader};
use indexmap::IndexMap;
use pbkdf2::pbkdf2_hmac;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Store entry holding the serialized state (ciphertext in encrypted mode).
pub const STATE_KEY: &str = "sp-plan";
/// Store entry holding the key-derivation salt.
pub const SALT_KEY: &str = "sp-salt";
/// Store entry holding the nonce of the most recent encrypted write.
pub const NONCE_KEY: &str = "sp-nonce";

const PBKDF2_ITERATIONS: u32 = 200_000;
const STATE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const MIN_PASSCODE_LEN: usize = 4;
const MAX_PASSCODE_LEN: usize = 12;
const CONFIRM_DELETE: &str = "DELETE";
const CONFIRM_PROCEED: &str = "YES";

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("incorrect passcode or corrupted data")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("import failed: {0}")]
    Import(String),
    #[error("passcode must be 4-12 characters")]
    InvalidPasscode,
    #[error("incorrect passcode")]
    IncorrectPasscode,
    #[error("session is locked")]
    Locked,
    #[error("store is not passcode protected")]
    NotEncrypted,
    #[error("unknown sheet: {0}")]
    UnknownSheet(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A row maps column names (from the sheet's `columns`) to cell values.
/// Values stay strings; numeric parsing happens at display time.
pub type Row = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default = "default_state_version")]
    pub version: u32,
    #[serde(rename = "workbookName", default)]
    pub workbook_name: String,
    #[serde(default)]
    pub sheets: IndexMap<String, Sheet>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            workbook_name: String::new(),
            sheets: IndexMap::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub mapping: Mapping,
}

/// Column assignment for the four logical fields. An empty string means
/// "unset"; edits through an unset field are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub eod: String,
    #[serde(default)]
    pub allow: String,
    #[serde(default)]
    pub comment: String,
}

impl Mapping {
    pub fn column_for(&self, field: Field) -> Option<&str> {
        let name = match field {
            Field::Date => self.date.as_str(),
            Field::Eod => self.eod.as_str(),
            Field::Allow => self.allow.as_str(),
            Field::Comment => self.comment.as_str(),
        };
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Date,
    Eod,
    Allow,
    Comment,
}

/// Derived display statistics for one sheet. Each entry is present only
/// when the corresponding logical field is mapped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetSummary {
    /// Last non-empty end-of-day value, in row order.
    pub last_eod: Option<String>,
    /// Sum of end-of-day values; unparseable cells count as zero.
    pub eod_sum: Option<f64>,
    /// Average allowance over all rows, unparseable rows included in the
    /// denominator.
    pub allow_avg: Option<f64>,
}

fn default_state_version() -> u32 {
    STATE_VERSION
}

/// Guesses which imported column belongs to each logical field from the
/// column names. Pure; first match in column order wins.
pub fn guess_mapping(columns: &[String]) -> Mapping {
    let date = columns
        .iter()
        .find(|c| date_pattern().is_match(c))
        .or_else(|| columns.first())
        .cloned()
        .unwrap_or_default();
    let eod = find_normalized(columns, eod_pattern());
    let allow = find_normalized(columns, allow_pattern());
    let comment = find_normalized(columns, comment_pattern());
    Mapping {
        date,
        eod,
        allow,
        comment,
    }
}

fn find_normalized(columns: &[String], pattern: &Regex) -> String {
    columns
        .iter()
        .find(|c| pattern.is_match(normalize_column(c).as_str()))
        .cloned()
        .unwrap_or_default()
}

fn normalize_column(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("(?i)date|day").expect("hard-coded pattern"))
}

fn eod_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("end.*day.*bal|e.?o.?d|balance").expect("hard-coded pattern"))
}

fn allow_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("allow|budget").expect("hard-coded pattern"))
}

fn comment_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("comment|note|memo").expect("hard-coded pattern"))
}

/// Directory-backed key-value entries, one file per key.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.as_path())?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        write_text_file(self.entry_path(key).as_path(), value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entry_path(key).exists()
    }
}

fn write_text_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Stage under a side name and rename, so a torn write never lands
    // under the live key.
    let staged = path.with_extension("tmp");
    fs::write(staged.as_path(), content)?;
    fs::rename(staged, path)?;
    Ok(())
}

/// AES-256 key derived from the passcode. The raw bytes never leave this
/// module: no `Clone`, no `Serialize`, redacted `Debug`.
pub struct SealedKey([u8; 32]);

impl SealedKey {
    fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedKey(..)")
    }
}

fn load_or_create_salt(store: &LocalStore) -> Result<Vec<u8>> {
    if let Some(raw) = store.get(SALT_KEY)? {
        if let Some(salt) = decode_b64(raw.as_str()) {
            if salt.len() == SALT_LEN {
                return Ok(salt);
            }
        }
    }
    // Persist before deriving anything so repeat unlocks see the same salt.
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    store.set(SALT_KEY, encode_b64(&salt).as_str())?;
    Ok(salt.to_vec())
}

/// Derives the encryption key for `passcode`, generating and persisting the
/// installation salt on first use. Deterministic in (passcode, salt), which
/// is what makes verification-by-decryption work.
pub fn derive_key(store: &LocalStore, passcode: &str) -> Result<SealedKey> {
    let salt = load_or_create_salt(store)?;
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        passcode.as_bytes(),
        salt.as_slice(),
        PBKDF2_ITERATIONS,
        &mut key,
    );
    Ok(SealedKey(key))
}

/// Authenticated-encryption wrapper around the local store. Every save uses
/// a fresh nonce; nonce and ciphertext are persisted as separate base64
/// entries next to the salt.
#[derive(Debug)]
pub struct EncryptedStore {
    store: LocalStore,
    key: SealedKey,
}

impl EncryptedStore {
    pub fn new(store: LocalStore, key: SealedKey) -> Self {
        Self { store, key }
    }

    pub fn save(&self, state: &AppState) -> Result<()> {
        let plaintext = serde_json::to_vec(state)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher =
            Aes256Gcm::new_from_slice(self.key.bytes()).map_err(|_| Error::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| Error::Encryption)?;
        self.store.set(NONCE_KEY, encode_b64(&nonce).as_str())?;
        self.store
            .set(STATE_KEY, encode_b64(ciphertext.as_slice()).as_str())?;
        Ok(())
    }

    /// Returns `None` when either entry is missing (first run). A failed
    /// authentication check surfaces as [`Error::Decryption`], which callers
    /// rely on to tell a wrong passcode apart from first use.
    pub fn load(&self) -> Result<Option<AppState>> {
        let Some(nonce_raw) = self.store.get(NONCE_KEY)? else {
            return Ok(None);
        };
        let Some(data_raw) = self.store.get(STATE_KEY)? else {
            return Ok(None);
        };
        let nonce = decode_b64(nonce_raw.as_str()).ok_or(Error::Decryption)?;
        let ciphertext = decode_b64(data_raw.as_str()).ok_or(Error::Decryption)?;
        if nonce.len() != NONCE_LEN || ciphertext.is_empty() {
            return Err(Error::Decryption);
        }
        let cipher =
            Aes256Gcm::new_from_slice(self.key.bytes()).map_err(|_| Error::Decryption)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce.as_slice()), ciphertext.as_slice())
            .map_err(|_| Error::Decryption)?;
        let state: AppState = serde_json::from_slice(plaintext.as_slice())?;
        Ok(Some(ensure_state_shape(state)))
    }

    /// Removes ciphertext and nonce. The salt entry stays, so the same
    /// passcode keeps deriving the same key after a wipe.
    pub fn wipe(&self) -> Result<()> {
        self.store.remove(STATE_KEY)?;
        self.store.remove(NONCE_KEY)?;
        Ok(())
    }
}

/// Unencrypted deployment mode: the state JSON goes straight into the
/// store. No confidentiality; absence or a parse failure falls back to a
/// fresh empty state that is persisted immediately.
#[derive(Debug)]
pub struct PlainStore {
    store: LocalStore,
}

impl PlainStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn save(&self, state: &AppState) -> Result<()> {
        self.store.set(STATE_KEY, serde_json::to_string(state)?.as_str())
    }

    pub fn load(&self) -> Result<AppState> {
        if let Some(raw) = self.store.get(STATE_KEY)? {
            if let Ok(state) = serde_json::from_str::<AppState>(raw.as_str()) {
                return Ok(ensure_state_shape(state));
            }
        }
        let state = AppState::new();
        self.save(&state)?;
        Ok(state)
    }

    pub fn wipe(&self) -> Result<()> {
        self.store.remove(STATE_KEY)
    }
}

fn ensure_state_shape(mut state: AppState) -> AppState {
    // A missing version decodes as STATE_VERSION via the serde default; an
    // explicit zero (hand-edited or pre-versioning export) is normalized here.
    if state.version == 0 {
        state.version = STATE_VERSION;
    }
    for sheet in state.sheets.values_mut() {
        let columns = std::mem::take(&mut sheet.columns);
        sheet.mapping = clamp_mapping(std::mem::take(&mut sheet.mapping), columns.as_slice());
        sheet.columns = columns;
    }
    state
}

/// Mapping entries must name one of the sheet's columns; anything else
/// resets to "unset".
fn clamp_mapping(mapping: Mapping, columns: &[String]) -> Mapping {
    let keep = |name: String| {
        if !name.is_empty() && columns.iter().any(|c| *c == name) {
            name
        } else {
            String::new()
        }
    };
    Mapping {
        date: keep(mapping.date),
        eod: keep(mapping.eod),
        allow: keep(mapping.allow),
        comment: keep(mapping.comment),
    }
}

/// One sheet as delivered by the import boundary: ordered header list plus
/// rows keyed by header, missing cells defaulted to empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedSheet {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Reads a workbook file into sheets. Returns `None` when the file does
/// not exist; the import flow treats that as a no-op. CSV files become a
/// single sheet named after the file stem; everything else goes through
/// the spreadsheet reader.
pub fn read_workbook(path: &Path) -> Result<Option<Vec<ImportedSheet>>> {
    if !path.exists() {
        return Ok(None);
    }
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let sheets = if ext == "csv" {
        vec![read_csv_sheet(path)?]
    } else {
        read_spreadsheet(path)?
    };
    Ok(Some(sheets))
}

/// Builds a fresh state from a workbook file, guessing a column mapping
/// per sheet. The previous state is meant to be replaced wholesale.
pub fn import_workbook_state(path: &Path) -> Result<Option<AppState>> {
    let Some(sheets) = read_workbook(path)? else {
        return Ok(None);
    };
    let mut state = AppState::new();
    state.workbook_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_string();
    for imported in sheets {
        let ImportedSheet {
            name,
            columns,
            rows,
        } = imported;
        let mapping = guess_mapping(columns.as_slice());
        state.sheets.insert(
            name,
            Sheet {
                columns,
                rows,
                mapping,
            },
        );
    }
    Ok(Some(state))
}

fn read_csv_sheet(path: &Path) -> Result<ImportedSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| Error::Import(err.to_string()))?;
    let columns: Vec<String> = reader
        .headers()
        .map_err(|err| Error::Import(err.to_string()))?
        .iter()
        .enumerate()
        .map(|(index, header)| header_name(header, index))
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| Error::Import(err.to_string()))?;
        let mut row = Row::new();
        for (index, column) in columns.iter().enumerate() {
            row.insert(
                column.clone(),
                record.get(index).unwrap_or_default().to_string(),
            );
        }
        rows.push(row);
    }
    let name = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("Sheet1")
        .to_string();
    Ok(ImportedSheet {
        name,
        columns,
        rows,
    })
}

fn read_spreadsheet(path: &Path) -> Result<Vec<ImportedSheet>> {
    let mut workbook = open_workbook_auto(path).map_err(|err| Error::Import(err.to_string()))?;
    let names = workbook.sheet_names().to_owned();
    let mut out = Vec::new();
    for name in names {
        let range = match workbook.worksheet_range(name.as_str()) {
            Ok(range) => range,
            Err(_) => continue,
        };
        let mut data_rows = range.rows();
        let Some(header) = data_rows.next() else {
            out.push(ImportedSheet {
                name,
                columns: Vec::new(),
                rows: Vec::new(),
            });
            continue;
        };
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(index, cell)| header_name(cell_text(cell).as_str(), index))
            .collect();
        let mut rows = Vec::new();
        for data_row in data_rows {
            let mut row = Row::new();
            for (index, column) in columns.iter().enumerate() {
                let value = data_row.get(index).map(cell_text).unwrap_or_default();
                row.insert(column.clone(), value);
            }
            rows.push(row);
        }
        out.push(ImportedSheet {
            name,
            columns,
            rows,
        });
    }
    Ok(out)
}

fn header_name(raw: &str, index: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        format!("Column {}", index + 1)
    } else {
        trimmed.to_string()
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) => value.clone(),
        Data::Bool(value) => value.to_string(),
        Data::Int(value) => value.to_string(),
        Data::Float(value) => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", *value as i64)
            } else {
                value.to_string()
            }
        }
        Data::DateTime(value) => value.as_f64().to_string(),
        Data::DateTimeIso(value) => value.clone(),
        Data::DurationIso(value) => value.clone(),
        Data::Error(_) => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Encrypted,
    Plain,
}

#[derive(Debug)]
enum Backend {
    Encrypted(EncryptedStore),
    Plain(PlainStore),
}

impl Backend {
    fn save(&self, state: &AppState) -> Result<()> {
        match self {
            Backend::Encrypted(store) => store.save(state),
            Backend::Plain(store) => store.save(state),
        }
    }

    fn wipe(&self) -> Result<()> {
        match self {
            Backend::Encrypted(store) => store.wipe(),
            Backend::Plain(store) => store.wipe(),
        }
    }
}

#[derive(Debug)]
struct Unlocked {
    backend: Backend,
    state: AppState,
    active_sheet: Option<String>,
}

/// Owns the in-memory state and the derived key, with an explicit
/// Locked -> Unlocked -> Locked lifecycle. All user actions run to
/// completion before the next; there is no concurrent access to the state.
#[derive(Debug)]
pub struct Session {
    store: LocalStore,
    mode: StoreMode,
    unlocked: Option<Unlocked>,
}

impl Session {
    /// Opens a session over the store rooted at `root`, initially locked.
    pub fn open(root: impl Into<PathBuf>, mode: StoreMode) -> Result<Self> {
        Ok(Self {
            store: LocalStore::open(root)?,
            mode,
            unlocked: None,
        })
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn is_locked(&self) -> bool {
        self.unlocked.is_none()
    }

    /// Whether a persisted state entry exists. Drives the first-run hint on
    /// the lock screen.
    pub fn has_stored_data(&self) -> bool {
        self.store.contains(STATE_KEY)
    }

    /// Unlocks the session. In encrypted mode a wrong passcode fails with
    /// [`Error::IncorrectPasscode`] and leaves both the session and the
    /// stored ciphertext untouched; an absent store initializes and persists
    /// an empty state. Plain mode ignores the passcode.
    pub fn unlock(&mut self, passcode: &str) -> Result<()> {
        match self.mode {
            StoreMode::Plain => {
                let backend = PlainStore::new(self.store.clone());
                let state = backend.load()?;
                self.finish_unlock(Backend::Plain(backend), state);
                Ok(())
            }
            StoreMode::Encrypted => {
                check_passcode_len(passcode)?;
                let key = derive_key(&self.store, passcode)?;
                let backend = EncryptedStore::new(self.store.clone(), key);
                let state = match backend.load() {
                    Ok(Some(state)) => state,
                    Ok(None) => {
                        let state = AppState::new();
                        backend.save(&state)?;
                        state
                    }
                    Err(Error::Decryption) => return Err(Error::IncorrectPasscode),
                    Err(err) => return Err(err),
                };
                self.finish_unlock(Backend::Encrypted(backend), state);
                Ok(())
            }
        }
    }

    fn finish_unlock(&mut self, backend: Backend, state: AppState) {
        let active_sheet = state.sheets.keys().next().cloned();
        self.unlocked = Some(Unlocked {
            backend,
            state,
            active_sheet,
        });
    }

    /// Drops the decrypted state and the derived key.
    pub fn lock(&mut self) {
        self.unlocked = None;
    }

    pub fn state(&self) -> Result<&AppState> {
        Ok(&self.unlocked()?.state)
    }

    pub fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self.unlocked()?.state.sheets.keys().cloned().collect())
    }

    pub fn sheet(&self, name: &str) -> Result<&Sheet> {
        self.unlocked()?
            .state
            .sheets
            .get(name)
            .ok_or_else(|| Error::UnknownSheet(name.to_string()))
    }

    pub fn active_sheet(&self) -> Result<Option<&str>> {
        Ok(self.unlocked()?.active_sheet.as_deref())
    }

    pub fn select_sheet(&mut self, name: &str) -> Result<()> {
        let unlocked = self.unlocked_mut()?;
        if !unlocked.state.sheets.contains_key(name) {
            return Err(Error::UnknownSheet(name.to_string()));
        }
        unlocked.active_sheet = Some(name.to_string());
        Ok(())
    }

    /// Replaces the whole state with a freshly imported workbook and
    /// persists it. Returns `false` without touching anything when the file
    /// does not exist.
    pub fn import_workbook(&mut self, path: &Path) -> Result<bool> {
        self.unlocked()?;
        let Some(state) = import_workbook_state(path)? else {
            return Ok(false);
        };
        let unlocked = self.unlocked_mut()?;
        unlocked.state = state;
        unlocked.active_sheet = unlocked.state.sheets.keys().next().cloned();
        unlocked.backend.save(&unlocked.state)?;
        Ok(true)
    }

    /// Stores the mapping for one sheet and persists. Entries that do not
    /// name a real column become unset.
    pub fn set_mapping(&mut self, sheet: &str, mapping: Mapping) -> Result<()> {
        let unlocked = self.unlocked_mut()?;
        {
            let target = unlocked
                .state
                .sheets
                .get_mut(sheet)
                .ok_or_else(|| Error::UnknownSheet(sheet.to_string()))?;
            target.mapping = clamp_mapping(mapping, target.columns.as_slice());
        }
        unlocked.backend.save(&unlocked.state)
    }

    /// Writes `value` into the column the sheet currently maps `field` to.
    /// An unmapped field or out-of-range row is a silent no-op returning
    /// `false`, with no store write. A successful edit mutates exactly that
    /// row and column and persists once.
    pub fn edit_cell(
        &mut self,
        sheet: &str,
        row_index: usize,
        field: Field,
        value: &str,
    ) -> Result<bool> {
        let unlocked = self.unlocked_mut()?;
        {
            let target = unlocked
                .state
                .sheets
                .get_mut(sheet)
                .ok_or_else(|| Error::UnknownSheet(sheet.to_string()))?;
            let Some(column) = target.mapping.column_for(field).map(str::to_string) else {
                return Ok(false);
            };
            let Some(row) = target.rows.get_mut(row_index) else {
                return Ok(false);
            };
            row.insert(column, value.to_string());
        }
        unlocked.backend.save(&unlocked.state)?;
        Ok(true)
    }

    pub fn summary(&self, sheet: &str) -> Result<SheetSummary> {
        Ok(sheet_summary(self.sheet(sheet)?))
    }

    /// Pretty-printed JSON of the full current state.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.unlocked()?.state)?)
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        write_text_file(path, self.export_json()?.as_str())
    }

    /// Wipes all stored data after two typed confirmations (`DELETE`, then
    /// `YES`); any mismatch aborts with no change. The salt entry survives,
    /// so re-unlocking with the same passcode yields the reset empty state
    /// rather than a decryption error.
    pub fn delete_all_data(&mut self, confirm: &str, acknowledge: &str) -> Result<bool> {
        let unlocked = self.unlocked_mut()?;
        if confirm != CONFIRM_DELETE || acknowledge != CONFIRM_PROCEED {
            return Ok(false);
        }
        unlocked.backend.wipe()?;
        unlocked.state = AppState::new();
        unlocked.active_sheet = None;
        unlocked.backend.save(&unlocked.state)?;
        Ok(true)
    }

    /// Verification by attempted decryption: a candidate passcode is
    /// accepted when decryption succeeds *or* the store is absent, so a
    /// freshly initialized store rejects nothing. Only an authentication
    /// failure rejects. Never disturbs the active key.
    pub fn test_passcode(&self, passcode: &str) -> Result<bool> {
        if self.mode != StoreMode::Encrypted {
            return Err(Error::NotEncrypted);
        }
        let key = derive_key(&self.store, passcode)?;
        let probe = EncryptedStore::new(self.store.clone(), key);
        match probe.load() {
            Ok(_) => Ok(true),
            Err(Error::Decryption) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Re-encrypts the current state under a key derived from `next`. The
    /// installation salt is reused as-is; only the passcode changes.
    pub fn change_passcode(&mut self, current: &str, next: &str) -> Result<()> {
        if self.mode != StoreMode::Encrypted {
            return Err(Error::NotEncrypted);
        }
        if !self.test_passcode(current)? {
            return Err(Error::IncorrectPasscode);
        }
        check_passcode_len(next)?;
        let key = derive_key(&self.store, next)?;
        let store = self.store.clone();
        let unlocked = self.unlocked_mut()?;
        let backend = EncryptedStore::new(store, key);
        backend.save(&unlocked.state)?;
        unlocked.backend = Backend::Encrypted(backend);
        Ok(())
    }

    fn unlocked(&self) -> Result<&Unlocked> {
        self.unlocked.as_ref().ok_or(Error::Locked)
    }

    fn unlocked_mut(&mut self) -> Result<&mut Unlocked> {
        self.unlocked.as_mut().ok_or(Error::Locked)
    }
}

fn check_passcode_len(passcode: &str) -> Result<()> {
    let len = passcode.chars().count();
    if (MIN_PASSCODE_LEN..=MAX_PASSCODE_LEN).contains(&len) {
        Ok(())
    } else {
        Err(Error::InvalidPasscode)
    }
}

fn sheet_summary(sheet: &Sheet) -> SheetSummary {
    let mut out = SheetSummary::default();
    if let Some(column) = sheet.mapping.column_for(Field::Eod) {
        out.last_eod = sheet
            .rows
            .iter()
            .rev()
            .filter_map(|row| row.get(column))
            .find(|value| !value.is_empty())
            .cloned();
        out.eod_sum = Some(column_sum(sheet.rows.as_slice(), column));
    }
    if let Some(column) = sheet.mapping.column_for(Field::Allow) {
        let total = column_sum(sheet.rows.as_slice(), column);
        out.allow_avg = Some(total / sheet.rows.len().max(1) as f64);
    }
    out
}

fn column_sum(rows: &[Row], column: &str) -> f64 {
    rows.iter()
        .map(|row| {
            row.get(column)
                .and_then(|value| parse_float_loose(value))
                .unwrap_or(0.0)
        })
        .sum()
}

/// Longest-numeric-prefix parse: "12.5 left" reads as 12.5, "abc" as
/// nothing. Mirrors how the display layer has always read cell values.
fn parse_float_loose(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    if seen_digit && end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digits_from = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_from {
            end = exp_end;
        }
    }
    if !seen_digit {
        return None;
    }
    trimmed[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

fn decode_b64(value: &str) -> Option<Vec<u8>> {
    B64.decode(value.trim()).ok()
}

fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn guess_mapping_recognizes_standard_headers() {
        let mapping = guess_mapping(&cols(&["Date", "EOD Balance", "Allowance", "Notes"]));
        assert_eq!(mapping.date, "Date");
        assert_eq!(mapping.eod, "EOD Balance");
        assert_eq!(mapping.allow, "Allowance");
        assert_eq!(mapping.comment, "Notes");
    }

    #[test]
    fn guess_mapping_falls_back_to_first_column_for_date_only() {
        let mapping = guess_mapping(&cols(&["X", "Y"]));
        assert_eq!(mapping.date, "X");
        assert_eq!(mapping.eod, "");
        assert_eq!(mapping.allow, "");
        assert_eq!(mapping.comment, "");
    }

    #[test]
    fn guess_mapping_normalizes_punctuation_and_case() {
        let mapping = guess_mapping(&cols(&[
            "Day",
            "End-of-Day Bal.",
            "Planned Budget",
            "Memo!",
        ]));
        assert_eq!(mapping.date, "Day");
        assert_eq!(mapping.eod, "End-of-Day Bal.");
        assert_eq!(mapping.allow, "Planned Budget");
        assert_eq!(mapping.comment, "Memo!");
    }

    #[test]
    fn guess_mapping_of_no_columns_is_all_unset() {
        assert_eq!(guess_mapping(&[]), Mapping::default());
    }

    #[test]
    fn guess_mapping_ties_break_on_first_occurrence() {
        let mapping = guess_mapping(&cols(&["Balance A", "Balance B"]));
        assert_eq!(mapping.eod, "Balance A");
        // No date-like name, so date falls back to the first column.
        assert_eq!(mapping.date, "Balance A");
    }

    #[test]
    fn parse_float_loose_takes_numeric_prefix() {
        assert_eq!(parse_float_loose("12.5"), Some(12.5));
        assert_eq!(parse_float_loose("  -3 "), Some(-3.0));
        assert_eq!(parse_float_loose("12.5 left"), Some(12.5));
        assert_eq!(parse_float_loose("1e3"), Some(1000.0));
        assert_eq!(parse_float_loose("1e"), Some(1.0));
        assert_eq!(parse_float_loose(".5"), Some(0.5));
        assert_eq!(parse_float_loose("abc"), None);
        assert_eq!(parse_float_loose(""), None);
        assert_eq!(parse_float_loose("-"), None);
    }

    #[test]
    fn clamp_mapping_drops_unknown_columns() {
        let columns = cols(&["Date", "Balance"]);
        let clamped = clamp_mapping(
            Mapping {
                date: "Date".to_string(),
                eod: "Gone".to_string(),
                allow: String::new(),
                comment: "Balance".to_string(),
            },
            columns.as_slice(),
        );
        assert_eq!(clamped.date, "Date");
        assert_eq!(clamped.eod, "");
        assert_eq!(clamped.allow, "");
        assert_eq!(clamped.comment, "Balance");
    }

    #[test]
    fn state_codec_preserves_sheet_order_and_field_names() {
        let mut state = AppState::new();
        for name in ["March", "January", "February"] {
            state.sheets.insert(name.to_string(), Sheet::default());
        }
        state.workbook_name = "plan.xlsx".to_string();

        let encoded = serde_json::to_string(&state).unwrap();
        assert!(encoded.contains("\"workbookName\":\"plan.xlsx\""));

        let decoded: AppState = serde_json::from_str(encoded.as_str()).unwrap();
        let names: Vec<&String> = decoded.sheets.keys().collect();
        assert_eq!(names, ["March", "January", "February"]);
    }

    #[test]
    fn state_decode_defaults_missing_fields() {
        let decoded: AppState =
            serde_json::from_str(r#"{"sheets":{"S":{"columns":["A"],"rows":[]}}}"#).unwrap();
        let shaped = ensure_state_shape(decoded);
        assert_eq!(shaped.version, STATE_VERSION);
        assert_eq!(shaped.workbook_name, "");
        assert_eq!(shaped.sheets["S"].mapping, Mapping::default());
    }

    #[test]
    fn state_decode_normalizes_explicit_zero_version() {
        let decoded: AppState =
            serde_json::from_str(r#"{"version":0,"workbookName":"","sheets":{}}"#).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(ensure_state_shape(decoded).version, STATE_VERSION);
    }

    #[test]
    fn summary_treats_unparseable_values_as_zero() {
        let sheet = Sheet {
            columns: cols(&["Date", "Balance", "Allowance"]),
            rows: vec![
                row(&[("Date", "1"), ("Balance", "100.5"), ("Allowance", "20")]),
                row(&[("Date", "2"), ("Balance", "n/a"), ("Allowance", "abc")]),
                row(&[("Date", "3"), ("Balance", ""), ("Allowance", "10")]),
            ],
            mapping: Mapping {
                date: "Date".to_string(),
                eod: "Balance".to_string(),
                allow: "Allowance".to_string(),
                comment: String::new(),
            },
        };
        let summary = sheet_summary(&sheet);
        // Row 3 has an empty balance, so the last non-empty value is "n/a".
        assert_eq!(summary.last_eod.as_deref(), Some("n/a"));
        assert_eq!(summary.eod_sum, Some(100.5));
        // Average over all three rows, not just the parseable ones.
        assert_eq!(summary.allow_avg, Some(10.0));
    }

    #[test]
    fn summary_is_empty_without_mappings() {
        let sheet = Sheet {
            columns: cols(&["A"]),
            rows: vec![row(&[("A", "5")])],
            mapping: Mapping::default(),
        };
        assert_eq!(sheet_summary(&sheet), SheetSummary::default());
    }

    #[test]
    fn sealed_key_debug_is_redacted() {
        let key = SealedKey([7u8; 32]);
        assert_eq!(format!("{key:?}"), "SealedKey(..)");
    }
}
