//! End-to-end tests of the two-phase report conversation, driven the way a
//! client would: sign the handshake, encrypt the archive with the issued key,
//! upload it under the issued token.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crash_report_server::config::ProtocolConfig;
use crash_report_server::conversation::{
    build_report_archive, public_key_from_pem, ChallengeRequest, ConversationProtocol,
    ConversationSession, DeduplicationStore, DigestService, Envelope, ExtractedReport,
    KeyExchangeService, PhaseOneOutcome, ProtocolError, RecordKey, SessionState,
    UploadSubmission, UploadedFile,
};
use crash_report_server::db::{create_pool, SqliteUploadLog, UploadRecord};
use crash_report_server::storage::{ArchiveStore, LocalArchiveStore};

const VERSION: &str = "1.4.0.1";
const DEBUG_INFO: &str = "os.name=Linux\njava.version=21.0.2\n";
const STACK_TRACE: &str = "java.lang.NullPointerException\n\tat net.rptools.Map.render(Map.java:42)\n";

struct Harness {
    dir: TempDir,
    protocol: ConversationProtocol,
    log: SqliteUploadLog,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(ProtocolConfig::default()).await
    }

    async fn with_config(config: ProtocolConfig) -> Self {
        Self::with_stores(
            config,
            |log| Arc::new(log),
            |archives| Arc::new(archives),
        )
        .await
    }

    /// Harness whose protocol sees the upload log and archive directory
    /// through the given wrappers
    async fn with_stores(
        config: ProtocolConfig,
        store: impl FnOnce(SqliteUploadLog) -> Arc<dyn DeduplicationStore>,
        archives: impl FnOnce(LocalArchiveStore) -> Arc<dyn ArchiveStore>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("reports.db").display());
        let log = SqliteUploadLog::new(create_pool(&url).await.unwrap());
        let local = LocalArchiveStore::new(dir.path().join("archives"));
        let protocol =
            ConversationProtocol::new(&config, store(log.clone()), archives(local)).unwrap();

        Self { dir, protocol, log }
    }

    fn digest(&self) -> &DigestService {
        self.protocol.digest()
    }

    fn record_key(&self, checksum: &str) -> RecordKey {
        RecordKey::new(self.protocol.tool_name(), VERSION, checksum)
    }

    fn stored_archives(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("archives")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Signed phase-1 envelope promising `stack_trace`
    fn handshake(&self, stack_trace: &str) -> Envelope {
        let checksum = self.digest().checksum(stack_trace).unwrap();
        let body = json!({
            "version": VERSION,
            "clienttime": 1_700_000_000_123i64,
            "checksum": checksum,
        });
        Envelope::sign(body.as_object().cloned().unwrap(), self.digest()).unwrap()
    }

    /// Run phase 1 and return the verified reply
    async fn challenge(&self, stack_trace: &str) -> Map<String, Value> {
        match self.protocol.begin(&self.handshake(stack_trace)).await.unwrap() {
            PhaseOneOutcome::Challenge(reply) => {
                assert!(reply.verify(self.digest()).unwrap());
                reply.body
            }
            PhaseOneOutcome::NothingToDo => panic!("expected a challenge"),
        }
    }
}

fn token_from(reply: &Map<String, Value>) -> String {
    let url = reply["url"].as_str().unwrap();
    let (_, token) = url.split_once("?r=").unwrap();
    urlencoding::decode(token).unwrap().into_owned()
}

fn encrypted_upload(reply: &Map<String, Value>, stack_trace: &str) -> UploadSubmission {
    encrypted_archive(reply, &build_report_archive(DEBUG_INFO, stack_trace).unwrap())
}

fn encrypted_archive(reply: &Map<String, Value>, archive: &[u8]) -> UploadSubmission {
    let public_key = public_key_from_pem(reply["publicKey"].as_str().unwrap()).unwrap();
    let data = KeyExchangeService::new().encrypt(archive, &public_key).unwrap();

    UploadSubmission {
        files: vec![UploadedFile {
            field_name: "zipfile".to_string(),
            file_name: "report.zip".to_string(),
            data,
        }],
        transport_error: None,
    }
}

#[tokio::test]
async fn test_report_is_stored() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;

    assert_eq!(reply["clienttime"], json!(1_700_000_000_123i64));
    assert!(reply["servertime"].is_i64());
    assert!(reply["publicKey"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN PUBLIC KEY-----"));

    let token = token_from(&reply);
    assert_eq!(token, harness.protocol.token_for(reply["publicKey"].as_str().unwrap()).unwrap());

    let receipt = harness
        .protocol
        .complete(&token, encrypted_upload(&reply, STACK_TRACE))
        .await
        .unwrap();

    let checksum = harness.digest().checksum(STACK_TRACE).unwrap();
    assert_eq!(receipt.record, harness.record_key(&checksum));

    let record = harness.log.get_record(&receipt.record).await.unwrap().unwrap();
    assert!(!record.is_reservation());
    assert_eq!(record.debug_info.as_deref(), Some(DEBUG_INFO));
    assert_eq!(record.stack_trace.as_deref(), Some(STACK_TRACE));
    assert_eq!(record.archive_location.as_deref(), Some(receipt.archive_location.as_str()));
    assert_eq!(harness.stored_archives(), 1);

    // Token is single use
    let replay = harness
        .protocol
        .complete(&token, encrypted_upload(&reply, STACK_TRACE))
        .await;
    assert!(matches!(replay, Err(ProtocolError::Session(_))));
}

#[tokio::test]
async fn test_known_report_needs_nothing() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;
    harness
        .protocol
        .complete(&token_from(&reply), encrypted_upload(&reply, STACK_TRACE))
        .await
        .unwrap();

    let outcome = harness.protocol.begin(&harness.handshake(STACK_TRACE)).await.unwrap();
    assert!(matches!(outcome, PhaseOneOutcome::NothingToDo));
    assert_eq!(harness.protocol.sessions().session_count().await, 0);
}

#[tokio::test]
async fn test_tampered_handshake_opens_no_session() {
    let harness = Harness::new().await;

    let mut envelope = harness.handshake(STACK_TRACE);
    envelope.body.insert("version".to_string(), json!("9.9.9"));

    let result = harness.protocol.begin(&envelope).await;
    assert!(matches!(result, Err(ProtocolError::Authentication)));
    assert_eq!(harness.protocol.sessions().session_count().await, 0);
}

#[tokio::test]
async fn test_racing_uploads_store_once() {
    let harness = Harness::new().await;
    let first = harness.challenge(STACK_TRACE).await;
    let second = harness.challenge(STACK_TRACE).await;
    assert_ne!(token_from(&first), token_from(&second));

    let first_token = token_from(&first);
    let second_token = token_from(&second);
    let (a, b) = tokio::join!(
        harness
            .protocol
            .complete(&first_token, encrypted_upload(&first, STACK_TRACE)),
        harness
            .protocol
            .complete(&second_token, encrypted_upload(&second, STACK_TRACE)),
    );

    let outcomes = [a, b];
    let stored = outcomes.iter().filter(|r| r.is_ok()).count();
    let duplicates = outcomes
        .iter()
        .filter(|r| matches!(r, Err(ProtocolError::Duplicate)))
        .count();
    assert_eq!(stored, 1);
    assert_eq!(duplicates, 1);
    assert_eq!(harness.log.count().await.unwrap(), 1);
    assert_eq!(harness.stored_archives(), 1);
}

#[tokio::test]
async fn test_checksum_mismatch_rolls_back() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;

    let result = harness
        .protocol
        .complete(
            &token_from(&reply),
            encrypted_upload(&reply, "java.lang.OutOfMemoryError\n"),
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::ChecksumMismatch { .. })));
    let checksum = harness.digest().checksum(STACK_TRACE).unwrap();
    assert!(harness
        .log
        .get_record(&harness.record_key(&checksum))
        .await
        .unwrap()
        .is_none());
    assert_eq!(harness.log.count().await.unwrap(), 0);
    assert_eq!(harness.stored_archives(), 0);
}

#[tokio::test]
async fn test_undecryptable_upload_rolls_back() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;

    let mut submission = encrypted_upload(&reply, STACK_TRACE);
    submission.files[0].data = vec![7u8; 256];

    let result = harness.protocol.complete(&token_from(&reply), submission).await;
    assert!(matches!(result, Err(ProtocolError::Crypto(_))));
    assert_eq!(harness.log.count().await.unwrap(), 0);
    assert_eq!(harness.stored_archives(), 0);
}

#[tokio::test]
async fn test_expired_session_is_rejected() {
    let harness = Harness::with_config(ProtocolConfig {
        session_timeout_minutes: 0,
        ..ProtocolConfig::default()
    })
    .await;
    let reply = harness.challenge(STACK_TRACE).await;
    let token = token_from(&reply);

    let result = harness
        .protocol
        .complete(&token, encrypted_upload(&reply, STACK_TRACE))
        .await;

    assert!(matches!(result, Err(ProtocolError::Session(_))));
    assert!(!harness.protocol.sessions().contains(&token).await);
    assert_eq!(harness.log.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_forged_token_destroys_session() {
    let harness = Harness::new().await;

    let request = ChallengeRequest {
        version: VERSION.to_string(),
        client_time: json!(1),
        checksum: harness.digest().checksum(STACK_TRACE).unwrap(),
    };
    let key_pair = KeyExchangeService::new().generate_key_pair().unwrap();
    let public_key_pem = key_pair.public_key_pem.clone();
    let mut session = ConversationSession::new(
        "forged-token".to_string(),
        key_pair,
        harness.protocol.tool_name().to_string(),
        &request,
    );
    session.advance(SessionState::Challenged).unwrap();
    harness.protocol.sessions().create_session(session).await.unwrap();

    let reply = json!({ "publicKey": public_key_pem });
    let result = harness
        .protocol
        .complete(
            "forged-token",
            encrypted_upload(reply.as_object().unwrap(), STACK_TRACE),
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::Session(_))));
    assert!(!harness.protocol.sessions().contains("forged-token").await);
    assert_eq!(harness.log.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_badly_shaped_upload_keeps_session() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;
    let token = token_from(&reply);

    let mut wrong_field = encrypted_upload(&reply, STACK_TRACE);
    wrong_field.files[0].field_name = "file".to_string();
    let result = harness.protocol.complete(&token, wrong_field).await;
    assert!(matches!(result, Err(ProtocolError::UploadShape(_))));

    let mut wrong_name = encrypted_upload(&reply, STACK_TRACE);
    wrong_name.files[0].file_name = "report.tar".to_string();
    let result = harness.protocol.complete(&token, wrong_name).await;
    assert!(matches!(result, Err(ProtocolError::UploadShape(_))));

    assert!(harness.protocol.sessions().contains(&token).await);

    harness
        .protocol
        .complete(&token, encrypted_upload(&reply, STACK_TRACE))
        .await
        .unwrap();
    assert_eq!(harness.log.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_maintenance_reaps_expired_sessions() {
    let harness = Harness::with_config(ProtocolConfig {
        session_timeout_minutes: 0,
        ..ProtocolConfig::default()
    })
    .await;
    harness.challenge(STACK_TRACE).await;
    assert_eq!(harness.protocol.sessions().session_count().await, 1);

    harness.protocol.run_maintenance().await.unwrap();
    assert_eq!(harness.protocol.sessions().session_count().await, 0);
}

// ============================================================================
// Rollback and cancellation
// ============================================================================

/// Archive store that takes its time before writing
struct SlowArchives {
    inner: LocalArchiveStore,
    delay: Duration,
}

#[async_trait::async_trait]
impl ArchiveStore for SlowArchives {
    async fn persist(&self, data: &[u8]) -> Result<String, ProtocolError> {
        tokio::time::sleep(self.delay).await;
        self.inner.persist(data).await
    }

    async fn discard(&self, location: &str) -> Result<(), ProtocolError> {
        self.inner.discard(location).await
    }
}

/// Upload log whose completion step always fails
struct FailingUpdates(SqliteUploadLog);

#[async_trait::async_trait]
impl DeduplicationStore for FailingUpdates {
    async fn check_for_record(
        &self,
        key: &RecordKey,
    ) -> Result<Option<DateTime<Utc>>, ProtocolError> {
        self.0.check_for_record(key).await
    }

    async fn check_and_create_record(&self, key: &RecordKey) -> Result<bool, ProtocolError> {
        self.0.check_and_create_record(key).await
    }

    async fn update_record(
        &self,
        _key: &RecordKey,
        _report: &ExtractedReport,
        _archive_location: &str,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::Database("disk I/O error".to_string()))
    }

    async fn remove_record(&self, key: &RecordKey) -> Result<(), ProtocolError> {
        self.0.remove_record(key).await
    }

    async fn purge_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<u64, ProtocolError> {
        self.0.purge_stale_reservations(cutoff).await
    }
}

async fn slow_harness() -> Harness {
    Harness::with_stores(
        ProtocolConfig::default(),
        |log| Arc::new(log),
        |local| {
            Arc::new(SlowArchives {
                inner: local,
                delay: Duration::from_millis(500),
            })
        },
    )
    .await
}

/// Poll the log until `key` is no longer an open reservation
async fn settled_record(log: &SqliteUploadLog, key: &RecordKey) -> Option<UploadRecord> {
    for _ in 0..200 {
        match log.get_record(key).await.unwrap() {
            Some(record) if record.is_reservation() => {}
            settled => return settled,
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("reservation for {:?} never settled", key);
}

fn archive_without_stack_trace() -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
        zip.start_file("debuginfo.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(DEBUG_INFO.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buffer
}

#[tokio::test]
async fn test_archive_missing_entry_rolls_back() {
    let harness = Harness::new().await;
    let reply = harness.challenge(STACK_TRACE).await;

    let result = harness
        .protocol
        .complete(
            &token_from(&reply),
            encrypted_archive(&reply, &archive_without_stack_trace()),
        )
        .await;

    assert!(matches!(result, Err(ProtocolError::Archive(msg)) if msg.contains("exception.txt")));
    assert_eq!(harness.log.count().await.unwrap(), 0);
    assert_eq!(harness.stored_archives(), 0);
}

#[tokio::test]
async fn test_failed_record_update_rolls_back() {
    let harness = Harness::with_stores(
        ProtocolConfig::default(),
        |log| Arc::new(FailingUpdates(log)),
        |local| Arc::new(local),
    )
    .await;
    let reply = harness.challenge(STACK_TRACE).await;

    let result = harness
        .protocol
        .complete(&token_from(&reply), encrypted_upload(&reply, STACK_TRACE))
        .await;

    assert!(matches!(result, Err(ProtocolError::Database(_))));
    assert_eq!(harness.log.count().await.unwrap(), 0);
    assert_eq!(harness.stored_archives(), 0);
}

#[tokio::test]
async fn test_dropped_request_still_stores_report() {
    let harness = slow_harness().await;
    let reply = harness.challenge(STACK_TRACE).await;
    let key = harness.record_key(&harness.digest().checksum(STACK_TRACE).unwrap());

    // The client hangs up while the archive is still being written
    let dropped = tokio::time::timeout(
        Duration::from_millis(100),
        harness
            .protocol
            .complete(&token_from(&reply), encrypted_upload(&reply, STACK_TRACE)),
    )
    .await;
    assert!(dropped.is_err());
    assert!(harness.log.get_record(&key).await.unwrap().unwrap().is_reservation());

    let record = settled_record(&harness.log, &key).await.unwrap();
    assert_eq!(record.stack_trace.as_deref(), Some(STACK_TRACE));
    assert_eq!(harness.stored_archives(), 1);

    let outcome = harness.protocol.begin(&harness.handshake(STACK_TRACE)).await.unwrap();
    assert!(matches!(outcome, PhaseOneOutcome::NothingToDo));
}

#[tokio::test]
async fn test_dropped_failing_request_releases_reservation() {
    let harness = slow_harness().await;
    let reply = harness.challenge(STACK_TRACE).await;
    let key = harness.record_key(&harness.digest().checksum(STACK_TRACE).unwrap());

    let dropped = tokio::time::timeout(
        Duration::from_millis(100),
        harness.protocol.complete(
            &token_from(&reply),
            encrypted_upload(&reply, "java.lang.OutOfMemoryError\n"),
        ),
    )
    .await;
    assert!(dropped.is_err());
    assert!(harness.log.get_record(&key).await.unwrap().unwrap().is_reservation());

    assert!(settled_record(&harness.log, &key).await.is_none());
    assert_eq!(harness.log.count().await.unwrap(), 0);
    assert_eq!(harness.stored_archives(), 0);

    // The report is not lost: a new handshake gets a fresh challenge
    let outcome = harness.protocol.begin(&harness.handshake(STACK_TRACE)).await.unwrap();
    assert!(matches!(outcome, PhaseOneOutcome::Challenge(_)));
}
