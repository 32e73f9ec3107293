use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::{QueueError, QueueResult};
use super::job::{Claim, ExpiredJob, JobState, StateCounts, TranscodeJob, from_millis, to_millis};
use super::ledger::JobLedger;
use crate::infrastructure::redis::client::RedisService;

const PREFIX: &str = "transcode";

// KEYS: job hash, pending set | ARGV: id, score, field/value pairs...
const CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

// KEYS: job hash, pending set, active set | ARGV: id, worker, now ms, lease ms
const CLAIM: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then return {'missing'} end
local now = tonumber(ARGV[3])
if state == 'active' then
  local expires = tonumber(redis.call('HGET', KEYS[1], 'lease_expires_at') or '0')
  if expires > now then
    return {'busy', redis.call('HGET', KEYS[1], 'lease_owner') or ''}
  end
elseif state ~= 'pending' then
  return {'finished', state}
end
local since = redis.call('HGET', KEYS[1], 'state_changed_at') or ARGV[3]
local created = redis.call('HGET', KEYS[1], 'created_at') or ARGV[3]
if state == 'pending' then redis.call('ZREM', KEYS[2], ARGV[1]) end
redis.call('ZADD', KEYS[3], created, ARGV[1])
redis.call('HINCRBY', KEYS[1], 'attempt_count', 1)
redis.call('HSET', KEYS[1], 'state', 'active', 'state_changed_at', ARGV[3],
  'lease_owner', ARGV[2], 'lease_expires_at', tostring(now + tonumber(ARGV[4])))
return {'claimed', state, since}
"#;

// KEYS: job hash | ARGV: worker, new expiry ms
const RENEW: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return 0 end
if redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'lease_expires_at', ARGV[2])
return 1
"#;

// KEYS: job hash, active set, target set | ARGV: id, worker, now ms, target state, error
const FINISH: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return 0 end
if redis.call('HGET', KEYS[1], 'lease_owner') ~= ARGV[2] then return 0 end
local created = redis.call('HGET', KEYS[1], 'created_at') or ARGV[3]
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], created, ARGV[1])
redis.call('HSET', KEYS[1], 'state', ARGV[4], 'state_changed_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'lease_owner', 'lease_expires_at')
if ARGV[4] == 'failed' then redis.call('HSET', KEYS[1], 'last_error', ARGV[5]) end
return 1
"#;

// KEYS: active set, pending set | ARGV: now ms, job key prefix
const REQUEUE_EXPIRED: &str = r#"
local moved = {}
for _, id in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  local key = ARGV[2] .. id
  if redis.call('EXISTS', key) == 0 then
    redis.call('ZREM', KEYS[1], id)
  elseif tonumber(redis.call('HGET', key, 'lease_expires_at') or '0') <= tonumber(ARGV[1]) then
    local created = redis.call('HGET', key, 'created_at') or ARGV[1]
    local since = redis.call('HGET', key, 'state_changed_at') or ARGV[1]
    local lecture = redis.call('HGET', key, 'lecture_id') or ''
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], created, id)
    redis.call('HSET', key, 'state', 'pending', 'state_changed_at', ARGV[1])
    redis.call('HDEL', key, 'lease_owner', 'lease_expires_at')
    table.insert(moved, id)
    table.insert(moved, lecture)
    table.insert(moved, since)
  end
end
return moved
"#;

fn job_key(job_id: &str) -> String {
    format!("{}:job:{}", PREFIX, job_id)
}

fn state_key(state: JobState) -> String {
    format!("{}:state:{}", PREFIX, state.as_str())
}

fn now_ms() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

/// Inclusive ZRANGE bounds for a page, `None` when the page lies past any
/// index Redis can address.
fn page_bounds(offset: usize, limit: usize) -> Option<(isize, isize)> {
    let start = isize::try_from(offset).ok()?;
    let span = isize::try_from(limit).ok()?.checked_sub(1)?;
    Some((start, start.checked_add(span)?))
}

// Flat reply: id, lecture id, active-since, ...
fn parse_expired(reply: &[String]) -> Vec<ExpiredJob> {
    reply
        .chunks(3)
        .filter_map(|entry| match entry {
            [id, lecture, since] => Some(ExpiredJob {
                job_id: Uuid::parse_str(id).ok()?,
                lecture_id: Uuid::parse_str(lecture).unwrap_or_default(),
                active_since: from_millis(since.parse().ok()?),
            }),
            _ => None,
        })
        .collect()
}

/// Redis-backed ledger: one hash per job plus one sorted set per state,
/// scored by creation time. Every transition runs as a Lua script so it is
/// atomic with respect to other workers.
pub struct RedisJobLedger {
    redis: RedisService,
    create: Script,
    claim: Script,
    renew: Script,
    finish: Script,
    requeue_expired: Script,
}

impl RedisJobLedger {
    pub fn new(redis: RedisService) -> Self {
        Self {
            redis,
            create: Script::new(CREATE),
            claim: Script::new(CLAIM),
            renew: Script::new(RENEW),
            finish: Script::new(FINISH),
            requeue_expired: Script::new(REQUEUE_EXPIRED),
        }
    }

    async fn finish(&self, job_id: Uuid, worker_id: &str, target: JobState, error: &str) -> QueueResult<bool> {
        let mut conn = self.redis.conn();
        let id = job_id.to_string();
        let changed: i64 = self
            .finish
            .key(job_key(&id))
            .key(state_key(JobState::Active))
            .key(state_key(target))
            .arg(&id)
            .arg(worker_id)
            .arg(now_ms())
            .arg(target.as_str())
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed == 1)
    }
}

fn encode(job: &TranscodeJob) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("job_id", job.job_id.to_string()),
        ("lecture_id", job.lecture_id.to_string()),
        ("source_path", job.source_path.to_string_lossy().into_owned()),
        ("video_name", job.video_name.clone()),
        ("state", job.state.as_str().to_string()),
        ("attempt_count", job.attempt_count.to_string()),
        ("created_at", to_millis(job.created_at).to_string()),
        ("state_changed_at", to_millis(job.state_changed_at).to_string()),
    ];
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone()));
    }
    if let Some(owner) = &job.lease_owner {
        fields.push(("lease_owner", owner.clone()));
    }
    if let Some(expires) = job.lease_expires_at {
        fields.push(("lease_expires_at", to_millis(expires).to_string()));
    }
    fields
}

fn decode(job_id: &str, mut hash: HashMap<String, String>) -> QueueResult<Option<TranscodeJob>> {
    if hash.is_empty() {
        return Ok(None);
    }

    let corrupt = |reason: String| QueueError::Corrupt {
        job_id: job_id.to_string(),
        reason,
    };
    let mut take = |field: &str| {
        hash.remove(field)
            .ok_or_else(|| corrupt(format!("missing field '{}'", field)))
    };

    let uuid = |raw: String| Uuid::parse_str(&raw).map_err(|e| corrupt(e.to_string()));
    let millis = |raw: String| {
        raw.parse::<i64>()
            .map(from_millis)
            .map_err(|e| corrupt(e.to_string()))
    };

    let job_id_field = take("job_id")?;
    let lecture_id = take("lecture_id")?;
    let source_path = take("source_path")?;
    let video_name = take("video_name")?;
    let state = take("state")?;
    let attempt_count = take("attempt_count")?;
    let created_at = take("created_at")?;
    let state_changed_at = take("state_changed_at")?;
    let last_error = hash.remove("last_error");
    let lease_owner = hash.remove("lease_owner");
    let lease_expires_at = hash.remove("lease_expires_at");

    Ok(Some(TranscodeJob {
        job_id: uuid(job_id_field)?,
        lecture_id: uuid(lecture_id)?,
        source_path: PathBuf::from(source_path),
        video_name,
        state: state.parse().map_err(corrupt)?,
        attempt_count: attempt_count.parse().map_err(|e: std::num::ParseIntError| corrupt(e.to_string()))?,
        last_error,
        created_at: millis(created_at)?,
        state_changed_at: millis(state_changed_at)?,
        lease_owner,
        lease_expires_at: lease_expires_at.map(millis).transpose()?,
    }))
}

#[async_trait]
impl JobLedger for RedisJobLedger {
    async fn create(&self, job: &TranscodeJob) -> QueueResult<()> {
        let mut conn = self.redis.conn();
        let id = job.job_id.to_string();

        let mut invocation = self.create.key(job_key(&id));
        invocation
            .key(state_key(JobState::Pending))
            .arg(&id)
            .arg(to_millis(job.created_at));
        for (field, value) in encode(job) {
            invocation.arg(field).arg(value);
        }

        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> QueueResult<Option<TranscodeJob>> {
        let mut conn = self.redis.conn();
        let id = job_id.to_string();
        let hash: HashMap<String, String> = conn.hgetall(job_key(&id)).await?;
        decode(&id, hash)
    }

    async fn claim(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<Claim> {
        let mut conn = self.redis.conn();
        let id = job_id.to_string();

        let reply: Vec<String> = self
            .claim
            .key(job_key(&id))
            .key(state_key(JobState::Pending))
            .key(state_key(JobState::Active))
            .arg(&id)
            .arg(worker_id)
            .arg(now_ms())
            .arg(lease.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        let corrupt = |reason: &str| QueueError::Corrupt {
            job_id: id.clone(),
            reason: reason.to_string(),
        };

        match reply.first().map(String::as_str) {
            Some("missing") => Ok(Claim::Missing),
            Some("busy") => Ok(Claim::Busy {
                lease_owner: reply.get(1).filter(|o| !o.is_empty()).cloned(),
            }),
            Some("finished") => {
                let state = reply
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| corrupt("unknown terminal state"))?;
                Ok(Claim::Finished(state))
            }
            Some("claimed") => {
                let previous: JobState = reply
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| corrupt("unknown previous state"))?;
                let previous_since = reply
                    .get(2)
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(from_millis)
                    .unwrap_or_else(OffsetDateTime::now_utc);

                match self.get(job_id).await? {
                    Some(job) => Ok(Claim::Claimed {
                        job,
                        previous,
                        previous_since,
                    }),
                    None => Ok(Claim::Missing),
                }
            }
            _ => Err(corrupt("unexpected claim reply")),
        }
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let mut conn = self.redis.conn();
        let expires = now_ms() + lease.as_millis() as i64;
        let renewed: i64 = self
            .renew
            .key(job_key(&job_id.to_string()))
            .arg(worker_id)
            .arg(expires)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool> {
        self.finish(job_id, worker_id, JobState::Completed, "").await
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error: &str) -> QueueResult<bool> {
        self.finish(job_id, worker_id, JobState::Failed, error).await
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> QueueResult<bool> {
        self.finish(job_id, worker_id, JobState::Pending, "").await
    }

    async fn requeue_expired(&self) -> QueueResult<Vec<ExpiredJob>> {
        let mut conn = self.redis.conn();
        let moved: Vec<String> = self
            .requeue_expired
            .key(state_key(JobState::Active))
            .key(state_key(JobState::Pending))
            .arg(now_ms())
            .arg(format!("{}:job:", PREFIX))
            .invoke_async(&mut conn)
            .await?;
        Ok(parse_expired(&moved))
    }

    async fn remove(&self, job_id: Uuid) -> QueueResult<()> {
        let mut conn = self.redis.conn();
        let id = job_id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().del(job_key(&id)).ignore();
        for state in JobState::ALL {
            pipe.zrem(state_key(state), &id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn counts(&self) -> QueueResult<StateCounts> {
        let mut conn = self.redis.conn();
        let (pending, active, completed, failed): (usize, usize, usize, usize) = redis::pipe()
            .zcard(state_key(JobState::Pending))
            .zcard(state_key(JobState::Active))
            .zcard(state_key(JobState::Completed))
            .zcard(state_key(JobState::Failed))
            .query_async(&mut conn)
            .await?;

        Ok(StateCounts {
            pending,
            active,
            completed,
            failed,
        })
    }

    async fn list(&self, state: JobState, offset: usize, limit: usize) -> QueueResult<Vec<TranscodeJob>> {
        let Some((start, stop)) = page_bounds(offset, limit) else {
            return Ok(Vec::new());
        };

        let mut conn = self.redis.conn();
        let ids: Vec<String> = conn.zrange(state_key(state), start, stop).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(job_key(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for (id, hash) in ids.iter().zip(hashes) {
            if let Some(job) = decode(id, hash)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job_key("abc"), "transcode:job:abc");
        assert_eq!(state_key(JobState::Failed), "transcode:state:failed");
    }

    #[test]
    fn hash_encoding_decodes_back() {
        let mut job = TranscodeJob::new(Uuid::new_v4(), PathBuf::from("/staging/x/source.mp4"), "intro-0a1b2c".into());
        job.state = JobState::Active;
        job.attempt_count = 2;
        job.lease_owner = Some("worker-a".into());
        job.lease_expires_at = Some(from_millis(to_millis(OffsetDateTime::now_utc())));

        let hash: HashMap<String, String> = encode(&job)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = decode(&job.job_id.to_string(), hash).unwrap().unwrap();

        assert_eq!(decoded.job_id, job.job_id);
        assert_eq!(decoded.state, JobState::Active);
        assert_eq!(decoded.attempt_count, 2);
        assert_eq!(decoded.lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(decoded.source_path, job.source_path);
        assert_eq!(decoded.lease_expires_at, job.lease_expires_at);
        assert!(decoded.last_error.is_none());
    }

    #[test]
    fn missing_and_corrupt_hashes() {
        assert!(decode("x", HashMap::new()).unwrap().is_none());

        let hash = HashMap::from([("job_id".to_string(), "not-a-uuid".to_string())]);
        assert!(matches!(decode("x", hash), Err(QueueError::Corrupt { .. })));
    }

    #[test]
    fn page_bounds_never_overflow() {
        assert_eq!(page_bounds(0, 50), Some((0, 49)));
        assert_eq!(page_bounds(10, 1), Some((10, 10)));
        assert_eq!(page_bounds(0, 0), None);
        assert_eq!(page_bounds(usize::MAX, 50), None);
        assert_eq!(page_bounds(isize::MAX as usize, 2), None);
        assert_eq!(page_bounds(isize::MAX as usize, 1), Some((isize::MAX, isize::MAX)));
    }

    #[test]
    fn expired_reply_carries_the_lecture() {
        let job_id = Uuid::new_v4();
        let lecture_id = Uuid::new_v4();
        let reply = vec![
            job_id.to_string(),
            lecture_id.to_string(),
            "1700000000000".to_string(),
            "not-a-uuid".to_string(),
            String::new(),
            "0".to_string(),
        ];

        let expired = parse_expired(&reply);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].job_id, job_id);
        assert_eq!(expired[0].lecture_id, lecture_id);
        assert_eq!(to_millis(expired[0].active_since), 1_700_000_000_000);
    }

    /// Runs the Lua transitions against a live server. Start one with
    /// `docker run -p 6379:6379 redis` and pass `--ignored`; `REDIS_URL`
    /// overrides the address.
    mod live {
        use super::*;
        use std::sync::Arc;

        const LEASE: Duration = Duration::from_secs(60);

        async fn ledger() -> RedisJobLedger {
            let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
            RedisJobLedger::new(RedisService::new(&url).await.unwrap())
        }

        fn job() -> TranscodeJob {
            TranscodeJob::new(Uuid::new_v4(), PathBuf::from("/staging/j/source.mp4"), "intro-abc123".into())
        }

        #[tokio::test]
        #[ignore = "needs a Redis server"]
        async fn claim_is_exclusive_until_finished() {
            let ledger = ledger().await;
            let job = job();
            ledger.create(&job).await.unwrap();

            let first = ledger.claim(job.job_id, "worker-a", LEASE).await.unwrap();
            assert!(matches!(first, Claim::Claimed { previous: JobState::Pending, .. }));
            match ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap() {
                Claim::Busy { lease_owner } => assert_eq!(lease_owner.as_deref(), Some("worker-a")),
                other => panic!("expected busy, got {other:?}"),
            }

            assert!(!ledger.complete(job.job_id, "worker-b").await.unwrap());
            assert!(ledger.renew(job.job_id, "worker-a", LEASE).await.unwrap());
            assert!(ledger.complete(job.job_id, "worker-a").await.unwrap());
            assert!(matches!(
                ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap(),
                Claim::Finished(JobState::Completed)
            ));

            ledger.remove(job.job_id).await.unwrap();
            assert!(ledger.get(job.job_id).await.unwrap().is_none());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        #[ignore = "needs a Redis server"]
        async fn concurrent_claims_have_a_single_winner() {
            let ledger = Arc::new(ledger().await);
            let job = job();
            ledger.create(&job).await.unwrap();

            let claims = (0..8).map(|n| {
                let ledger = ledger.clone();
                let job_id = job.job_id;
                tokio::spawn(async move { ledger.claim(job_id, &format!("worker-{n}"), LEASE).await.unwrap() })
            });
            let winners = futures_util::future::join_all(claims)
                .await
                .into_iter()
                .filter(|c| matches!(c, Ok(Claim::Claimed { .. })))
                .count();
            assert_eq!(winners, 1);

            ledger.remove(job.job_id).await.unwrap();
        }

        #[tokio::test]
        #[ignore = "needs a Redis server"]
        async fn lapsed_lease_is_requeued_with_its_lecture() {
            let ledger = ledger().await;
            let job = job();
            ledger.create(&job).await.unwrap();
            ledger.claim(job.job_id, "worker-a", Duration::from_millis(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            let moved = ledger.requeue_expired().await.unwrap();
            let ours = moved.iter().find(|e| e.job_id == job.job_id).unwrap();
            assert_eq!(ours.lecture_id, job.lecture_id);

            let stored = ledger.get(job.job_id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Pending);
            assert!(stored.lease_owner.is_none());
            assert!(!ledger.complete(job.job_id, "worker-a").await.unwrap());

            match ledger.claim(job.job_id, "worker-b", LEASE).await.unwrap() {
                Claim::Claimed { job, .. } => assert_eq!(job.attempt_count, 2),
                other => panic!("expected claim, got {other:?}"),
            }

            ledger.remove(job.job_id).await.unwrap();
        }

        #[tokio::test]
        #[ignore = "needs a Redis server"]
        async fn list_past_the_end_is_empty() {
            let ledger = ledger().await;
            assert!(ledger.list(JobState::Pending, usize::MAX, 50).await.unwrap().is_empty());
            assert!(ledger.list(JobState::Pending, 0, 0).await.unwrap().is_empty());
        }
    }
}
