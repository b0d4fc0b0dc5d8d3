use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::allowlist::AllowlistCache;
use crate::error::{BackendError, BanError, StateError};
use crate::firewall::FirewallBackend;
use crate::metrics::{
    ACTIVE_BANS, BACKEND_ERRORS_COUNTER, BANS_APPLIED_COUNTER, BANS_LIFTED_COUNTER,
};
use crate::request::BanRequest;
use crate::state::StateFile;
use crate::utils::{retry_op, RetryPolicy};

/// Delay before a firewall change the backend refused is tried again.
const EXPIRY_RETRY_SECS: i64 = 5;

/// One banned network, as tracked by the [`Coordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub address: IpNet,
    /// `None` while at least one overlapping request is permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub applied_at: DateTime<Utc>,
    /// Overlapping requests still holding the ban
    pub ref_count: u32,
    pub reason: Option<String>,
}

impl BanRecord {
    fn new(request: BanRequest, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            address: request.address,
            expires_at,
            applied_at: now,
            ref_count: 1,
            reason: request.reason,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Accounts for one more overlapping request: a permanent request makes
    /// the record permanent, a timed one can only push the expiry later.
    fn refresh(&mut self, expires_at: Option<DateTime<Utc>>, reason: Option<String>) {
        self.ref_count = self.ref_count.saturating_add(1);
        self.expires_at = match (self.expires_at, expires_at) {
            (Some(current), Some(new)) => Some(current.max(new)),
            _ => None,
        };
        if reason.is_some() {
            self.reason = reason;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// The firewall rule was added
    Applied,
    /// Already banned, only bookkeeping changed
    Refreshed { ref_count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbanOutcome {
    /// Other requests still hold the ban
    Released { ref_count: u32 },
    /// The firewall rule was removed
    Removed,
}

fn expiry_for(duration: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let duration = duration?;
    let expires_at = TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta));
    if expires_at.is_none() {
        warn!(msg = "Ban duration out of range, treating as permanent", ?duration);
    }
    expires_at
}

/// Owner of the ban table.
///
/// Every transition goes through `&mut self`, so transitions for the same
/// address never overlap. Backend changes are made before the table is
/// touched; a failed change leaves the table as it was.
#[derive(Debug)]
pub struct Coordinator<B> {
    backend: B,
    table: HashMap<IpNet, BanRecord>,
    /// May hold stale entries, checked against the table when popped
    expiries: BinaryHeap<Reverse<(DateTime<Utc>, IpNet)>>,
    /// Restored bans the backend refused, kept until they can be applied
    pending: HashMap<IpNet, BanRecord>,
    pending_retry_at: Option<DateTime<Utc>>,
    allowlist: Arc<AllowlistCache>,
    retry: RetryPolicy,
    state: Option<StateFile>,
}

impl<B: FirewallBackend> Coordinator<B> {
    pub fn new(backend: B, allowlist: Arc<AllowlistCache>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            table: HashMap::new(),
            expiries: BinaryHeap::new(),
            pending: HashMap::new(),
            pending_retry_at: None,
            allowlist,
            retry,
            state: None,
        }
    }

    pub fn with_state_file(mut self, state: StateFile) -> Self {
        self.state = Some(state);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn get(&self, address: &IpNet) -> Option<&BanRecord> {
        self.table.get(address)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether a restored ban is still waiting for the backend to accept it.
    pub fn is_pending(&self, address: &IpNet) -> bool {
        self.pending.contains_key(address)
    }

    /// Earliest time [`Coordinator::expire`] has work to do, possibly a
    /// stale expiry.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        let next = self.expiries.peek().map(|Reverse((at, _))| *at);
        match (next, self.pending_retry_at) {
            (Some(expiry), Some(retry)) => Some(expiry.min(retry)),
            (next, retry) => next.or(retry),
        }
    }

    #[instrument(skip(self, request), fields(address = %request.address))]
    pub async fn ban(
        &mut self,
        request: BanRequest,
        now: DateTime<Utc>,
    ) -> Result<BanOutcome, BanError> {
        let address = request.address;
        if self.allowlist.is_trusted(&address) {
            return Err(BanError::Trusted(address));
        }
        let expires_at = expiry_for(request.duration, now);

        if let Some(record) = self.table.get_mut(&address) {
            let previous = record.expires_at;
            record.refresh(expires_at, request.reason);
            let ref_count = record.ref_count;
            let refreshed = record.expires_at;
            if refreshed != previous {
                if let Some(at) = refreshed {
                    self.expiries.push(Reverse((at, address)));
                }
            }
            info!(msg = "Ban refreshed", ref_count, expires_at = ?refreshed);
            self.persist().await;
            return Ok(BanOutcome::Refreshed { ref_count });
        }

        self.apply_with_retry(address).await?;
        // a restored ban still waiting for the backend keeps its holders
        let record = match self.take_pending(&address) {
            Some(mut record) => {
                record.refresh(expires_at, request.reason);
                record
            }
            None => BanRecord::new(request, expires_at, now),
        };
        info!(msg = "Ban applied", expires_at = ?record.expires_at, reason = ?record.reason);
        self.commit(record);
        BANS_APPLIED_COUNTER.inc();
        self.update_gauge();
        self.persist().await;
        Ok(BanOutcome::Applied)
    }

    #[instrument(skip(self))]
    pub async fn unban(&mut self, address: IpNet) -> Result<UnbanOutcome, BanError> {
        let record = match self.table.get_mut(&address) {
            Some(record) => record,
            None => match self.pending.get_mut(&address) {
                Some(record) => record,
                None => return Err(BanError::NotFound(address)),
            },
        };

        if record.ref_count > 1 {
            record.ref_count -= 1;
            let ref_count = record.ref_count;
            info!(msg = "Ban released", ref_count);
            self.persist().await;
            return Ok(UnbanOutcome::Released { ref_count });
        }

        self.remove_with_retry(address).await?;
        self.table.remove(&address);
        self.take_pending(&address);
        info!(msg = "Ban removed");
        BANS_LIFTED_COUNTER.with_label_values(&["unban"]).inc();
        self.update_gauge();
        self.persist().await;
        Ok(UnbanOutcome::Removed)
    }

    /// Lifts every ban whose expiry is at or before `now`.
    ///
    /// Records expiring later are never touched. A removal the backend keeps
    /// refusing is left in place and tried again a few seconds later, as are
    /// restored bans still waiting to be applied.
    #[instrument(skip(self))]
    pub async fn expire(&mut self, now: DateTime<Utc>) -> Vec<IpNet> {
        let mut changed = false;
        if self.pending_retry_at.is_some_and(|at| at <= now) {
            changed = self.retry_pending(now).await;
        }

        let mut lifted = Vec::new();
        let mut failed = Vec::new();

        while let Some(Reverse((at, address))) = self.expiries.peek().copied() {
            if at > now {
                break;
            }
            self.expiries.pop();
            // stale when the record was extended, made permanent or lifted
            let due = self
                .table
                .get(&address)
                .and_then(|record| record.expires_at)
                .is_some_and(|expires_at| expires_at <= at);
            if !due {
                continue;
            }
            match self.remove_with_retry(address).await {
                Ok(()) => {
                    self.table.remove(&address);
                    info!(msg = "Ban expired", %address, expired_at = %at);
                    BANS_LIFTED_COUNTER.with_label_values(&["expired"]).inc();
                    lifted.push(address);
                }
                Err(_) => {
                    let retry_at = now + TimeDelta::seconds(EXPIRY_RETRY_SECS);
                    failed.push(Reverse((retry_at, address)));
                }
            }
        }
        self.expiries.extend(failed);

        if changed || !lifted.is_empty() {
            self.update_gauge();
            self.persist().await;
        }
        lifted
    }

    /// Reloads the state file: bans that expired while the daemon was down
    /// are removed from the firewall, the others are applied again.
    ///
    /// Nothing read from the file is dropped because the backend failed: a
    /// ban it refuses to apply stays pending, a stale ban it refuses to lift
    /// is scheduled for removal. Both are retried by [`Coordinator::expire`].
    #[instrument(skip(self))]
    pub async fn restore(&mut self, now: DateTime<Utc>) -> Result<usize, StateError> {
        let Some(state) = self.state.clone() else {
            return Ok(0);
        };
        let records = state.load().await?;
        info!(msg = "Restoring bans", path = %state.path().display(), count = records.len());

        for record in records {
            let address = record.address;
            if record.is_expired(now) || self.allowlist.is_trusted(&address) {
                self.lift_stale(record, now).await;
                continue;
            }
            match self.apply_with_retry(address).await {
                Ok(()) => self.commit(record),
                Err(err) => {
                    warn!(msg = "Could not restore ban, will retry", %address, %err);
                    self.pending.insert(address, record);
                }
            }
        }
        if !self.pending.is_empty() {
            self.pending_retry_at = Some(now + TimeDelta::seconds(EXPIRY_RETRY_SECS));
        }

        self.update_gauge();
        self.persist().await;
        Ok(self.table.len())
    }

    /// Returns whether the table changed.
    async fn retry_pending(&mut self, now: DateTime<Utc>) -> bool {
        self.pending_retry_at = None;
        let records: Vec<BanRecord> = self.pending.drain().map(|(_, record)| record).collect();
        let mut changed = false;
        for record in records {
            let address = record.address;
            if record.is_expired(now) || self.allowlist.is_trusted(&address) {
                self.lift_stale(record, now).await;
                changed = true;
                continue;
            }
            match self.apply_with_retry(address).await {
                Ok(()) => {
                    info!(msg = "Ban restored", %address);
                    self.commit(record);
                    changed = true;
                }
                Err(_) => {
                    self.pending.insert(address, record);
                }
            }
        }
        if !self.pending.is_empty() {
            self.pending_retry_at = Some(now + TimeDelta::seconds(EXPIRY_RETRY_SECS));
        }
        changed
    }

    /// Removes a ban that should no longer be in the firewall. When the
    /// backend refuses, the record is kept as already expired so the next
    /// expiry pass tries again.
    async fn lift_stale(&mut self, mut record: BanRecord, now: DateTime<Utc>) {
        let address = record.address;
        if let Err(err) = self.remove_with_retry(address).await {
            warn!(msg = "Could not lift stale ban, will retry", %address, %err);
            record.expires_at = Some(now);
            self.table.insert(address, record);
            let retry_at = now + TimeDelta::seconds(EXPIRY_RETRY_SECS);
            self.expiries.push(Reverse((retry_at, address)));
        }
    }

    fn commit(&mut self, record: BanRecord) {
        if let Some(at) = record.expires_at {
            self.expiries.push(Reverse((at, record.address)));
        }
        self.table.insert(record.address, record);
    }

    fn take_pending(&mut self, address: &IpNet) -> Option<BanRecord> {
        let record = self.pending.remove(address);
        if self.pending.is_empty() {
            self.pending_retry_at = None;
        }
        record
    }

    async fn apply_with_retry(&self, address: IpNet) -> Result<(), BackendError> {
        let backend = &self.backend;
        retry_op(&self.retry, || backend.apply(address))
            .await
            .inspect_err(|err| {
                BACKEND_ERRORS_COUNTER.with_label_values(&["apply"]).inc();
                error!(msg = "Failed to apply ban", backend = backend.name(), %address, %err);
            })
    }

    async fn remove_with_retry(&self, address: IpNet) -> Result<(), BackendError> {
        let backend = &self.backend;
        retry_op(&self.retry, || backend.remove(address))
            .await
            .inspect_err(|err| {
                BACKEND_ERRORS_COUNTER.with_label_values(&["remove"]).inc();
                error!(msg = "Failed to remove ban", backend = backend.name(), %address, %err);
            })
    }

    fn update_gauge(&self) {
        ACTIVE_BANS.set(self.table.len() as i64);
    }

    /// The table stays authoritative when the mirror cannot be written; the
    /// next completed operation writes it again.
    async fn persist(&self) {
        if let Some(state) = &self.state {
            let records = self.table.values().chain(self.pending.values());
            if let Err(err) = state.save(records).await {
                error!(msg = "Failed to save ban table", %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use ipnet::IpNet;

    use super::{BanOutcome, BanRecord, Coordinator, UnbanOutcome};
    use crate::allowlist::{AllowlistCache, IpRangeMixed};
    use crate::error::{BackendError, BanError};
    use crate::firewall::{DummyBackend, FirewallBackend};
    use crate::request::BanRequest;
    use crate::state::StateFile;
    use crate::utils::RetryPolicy;

    /// Dummy firewall that counts calls and can be switched to failing.
    #[derive(Debug, Default)]
    struct TestBackend {
        inner: DummyBackend,
        applies: AtomicUsize,
        removes: AtomicUsize,
        failing: AtomicBool,
    }

    impl TestBackend {
        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
        fn check(&self) -> Result<(), BackendError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(BackendError::Api(String::from("unreachable")))
            } else {
                Ok(())
            }
        }
    }

    impl FirewallBackend for TestBackend {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn apply(&self, net: IpNet) -> Result<(), BackendError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.apply(net).await
        }

        async fn remove(&self, net: IpNet) -> Result<(), BackendError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.remove(net).await
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn coordinator() -> Coordinator<TestBackend> {
        Coordinator::new(
            TestBackend::default(),
            Arc::new(AllowlistCache::default()),
            RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    fn is_blocked(coordinator: &Coordinator<TestBackend>, address: &str) -> bool {
        coordinator.backend().inner.is_applied(&net(address))
    }

    #[tokio::test]
    async fn ban_then_unban_restores_firewall() {
        let mut coordinator = coordinator();
        let before = coordinator.backend().inner.applied();

        let outcome = coordinator
            .ban(BanRequest::permanent(net("10.0.0.1/32")), t0())
            .await
            .unwrap();
        assert_eq!(outcome, BanOutcome::Applied);
        assert!(is_blocked(&coordinator, "10.0.0.1/32"));

        let outcome = coordinator.unban(net("10.0.0.1/32")).await.unwrap();
        assert_eq!(outcome, UnbanOutcome::Removed);
        assert_eq!(coordinator.backend().inner.applied(), before);
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn ref_counted_bans() {
        let mut coordinator = coordinator();
        let address = net("10.0.0.2/32");

        coordinator
            .ban(BanRequest::permanent(address), t0())
            .await
            .unwrap();
        let outcome = coordinator
            .ban(BanRequest::permanent(address), t0())
            .await
            .unwrap();
        assert_eq!(outcome, BanOutcome::Refreshed { ref_count: 2 });
        // no duplicate firewall rule
        assert_eq!(coordinator.backend().applies.load(Ordering::SeqCst), 1);

        let outcome = coordinator.unban(address).await.unwrap();
        assert_eq!(outcome, UnbanOutcome::Released { ref_count: 1 });
        assert!(is_blocked(&coordinator, "10.0.0.2/32"));
        assert_eq!(coordinator.backend().removes.load(Ordering::SeqCst), 0);

        let outcome = coordinator.unban(address).await.unwrap();
        assert_eq!(outcome, UnbanOutcome::Removed);
        assert!(!is_blocked(&coordinator, "10.0.0.2/32"));
    }

    #[tokio::test]
    async fn unban_unknown_address() {
        let mut coordinator = coordinator();
        let err = coordinator.unban(net("10.9.9.9/32")).await.unwrap_err();
        assert!(matches!(err, BanError::NotFound(_)));
    }

    #[tokio::test]
    async fn permanent_scenario() {
        let mut coordinator = coordinator();
        coordinator
            .ban(BanRequest::permanent(net("192.168.1.5/32")), t0())
            .await
            .unwrap();

        let record = coordinator.get(&net("192.168.1.5/32")).unwrap();
        assert_eq!(record.expires_at, None);
        assert_eq!(record.ref_count, 1);
        assert_eq!(coordinator.next_expiry(), None);

        let far_future = t0() + TimeDelta::days(3650);
        assert!(coordinator.expire(far_future).await.is_empty());
        assert!(is_blocked(&coordinator, "192.168.1.5/32"));
    }

    #[tokio::test]
    async fn timed_scenario() {
        let mut coordinator = coordinator();
        coordinator
            .ban(
                BanRequest::timed(net("10.0.0.1/32"), Duration::from_secs(60)),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(coordinator.next_expiry(), Some(t0() + TimeDelta::seconds(60)));

        let lifted = coordinator.expire(t0() + TimeDelta::seconds(61)).await;
        assert_eq!(lifted, vec![net("10.0.0.1/32")]);
        assert!(!is_blocked(&coordinator, "10.0.0.1/32"));
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn expire_spares_future_records() {
        let mut coordinator = coordinator();
        for (address, secs) in [("10.0.0.1/32", 10), ("10.0.0.2/32", 20), ("10.0.0.3/32", 30)] {
            coordinator
                .ban(BanRequest::timed(net(address), Duration::from_secs(secs)), t0())
                .await
                .unwrap();
        }

        let now = t0() + TimeDelta::seconds(20);
        let mut lifted = coordinator.expire(now).await;
        lifted.sort();
        assert_eq!(lifted, vec![net("10.0.0.1/32"), net("10.0.0.2/32")]);
        let remaining = coordinator.get(&net("10.0.0.3/32")).unwrap();
        assert!(remaining.expires_at.unwrap() > now);
        assert!(is_blocked(&coordinator, "10.0.0.3/32"));

        // a late or repeated tick does not process anything twice
        assert!(coordinator.expire(now).await.is_empty());
        assert_eq!(coordinator.backend().removes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rebans_extend_but_never_shorten() {
        let mut coordinator = coordinator();
        let address = net("10.0.0.4/32");
        coordinator
            .ban(BanRequest::timed(address, Duration::from_secs(60)), t0())
            .await
            .unwrap();
        coordinator
            .ban(BanRequest::timed(address, Duration::from_secs(10)), t0())
            .await
            .unwrap();
        assert_eq!(
            coordinator.get(&address).unwrap().expires_at,
            Some(t0() + TimeDelta::seconds(60))
        );

        coordinator
            .ban(BanRequest::timed(address, Duration::from_secs(120)), t0())
            .await
            .unwrap();
        // the stale 60s heap entry must not lift the extended ban
        assert!(coordinator.expire(t0() + TimeDelta::seconds(61)).await.is_empty());
        assert!(is_blocked(&coordinator, "10.0.0.4/32"));

        coordinator
            .ban(BanRequest::permanent(address), t0())
            .await
            .unwrap();
        assert_eq!(coordinator.get(&address).unwrap().expires_at, None);
        assert!(coordinator.expire(t0() + TimeDelta::days(1)).await.is_empty());
    }

    #[tokio::test]
    async fn failed_apply_commits_nothing() {
        let mut coordinator = coordinator();
        coordinator.backend().fail(true);

        let err = coordinator
            .ban(BanRequest::permanent(net("10.0.0.5/32")), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, BanError::Backend(_)));
        assert!(coordinator.is_empty());
        // bounded retries
        assert_eq!(coordinator.backend().applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_remove_keeps_record() {
        let mut coordinator = coordinator();
        let address = net("10.0.0.6/32");
        coordinator
            .ban(BanRequest::timed(address, Duration::from_secs(5)), t0())
            .await
            .unwrap();
        coordinator.backend().fail(true);

        assert!(matches!(
            coordinator.unban(address).await,
            Err(BanError::Backend(_))
        ));
        assert_eq!(coordinator.get(&address).unwrap().ref_count, 1);

        let later = t0() + TimeDelta::seconds(10);
        assert!(coordinator.expire(later).await.is_empty());
        assert!(coordinator.get(&address).is_some());
        let retry_at = later + TimeDelta::seconds(5);
        assert_eq!(coordinator.next_expiry(), Some(retry_at));

        coordinator.backend().fail(false);
        assert_eq!(coordinator.expire(retry_at).await, vec![address]);
        assert!(!is_blocked(&coordinator, "10.0.0.6/32"));
    }

    #[tokio::test]
    async fn trusted_networks_are_never_banned() {
        let allowlist = Arc::new(AllowlistCache::new(IpRangeMixed::from(vec![net(
            "127.0.0.0/8",
        )])));
        let mut coordinator = Coordinator::new(
            TestBackend::default(),
            allowlist.clone(),
            RetryPolicy::default(),
        );

        let err = coordinator
            .ban(BanRequest::permanent(net("127.0.0.1/32")), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, BanError::Trusted(_)));
        assert_eq!(coordinator.backend().applies.load(Ordering::SeqCst), 0);

        allowlist.store(IpRangeMixed::default());
        coordinator
            .ban(BanRequest::permanent(net("127.0.0.1/32")), t0())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bans_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("bans.jsonl"));

        let mut first = coordinator().with_state_file(state.clone());
        first
            .ban(BanRequest::permanent(net("10.0.0.7/32")), t0())
            .await
            .unwrap();
        first
            .ban(
                BanRequest::timed(net("10.0.0.8/32"), Duration::from_secs(30)),
                t0(),
            )
            .await
            .unwrap();
        first
            .ban(
                BanRequest::timed(net("10.0.0.9/32"), Duration::from_secs(300)),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(state.load().await.unwrap().len(), 3);

        let mut restarted = coordinator().with_state_file(state.clone());
        let restored = restarted
            .restore(t0() + TimeDelta::seconds(60))
            .await
            .unwrap();
        assert_eq!(restored, 2);
        assert!(is_blocked(&restarted, "10.0.0.7/32"));
        assert!(is_blocked(&restarted, "10.0.0.9/32"));
        assert!(restarted.get(&net("10.0.0.8/32")).is_none());
        // the expired ban was lifted in case the firewall still had it
        assert_eq!(restarted.backend().removes.load(Ordering::SeqCst), 1);

        let saved: Vec<BanRecord> = state.load().await.unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(
            restarted.next_expiry(),
            Some(t0() + TimeDelta::seconds(300))
        );
    }

    async fn saved_bans(state: &StateFile) -> Coordinator<TestBackend> {
        let mut first = coordinator().with_state_file(state.clone());
        first
            .ban(BanRequest::permanent(net("10.0.0.7/32")), t0())
            .await
            .unwrap();
        first
            .ban(
                BanRequest::timed(net("10.0.0.8/32"), Duration::from_secs(30)),
                t0(),
            )
            .await
            .unwrap();
        first
            .ban(
                BanRequest::timed(net("10.0.0.9/32"), Duration::from_secs(300)),
                t0(),
            )
            .await
            .unwrap();
        coordinator().with_state_file(state.clone())
    }

    #[tokio::test]
    async fn restore_keeps_bans_the_backend_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("bans.jsonl"));
        let mut restarted = saved_bans(&state).await;
        restarted.backend().fail(true);

        let restarted_at = t0() + TimeDelta::seconds(60);
        restarted.restore(restarted_at).await.unwrap();
        assert!(restarted.is_pending(&net("10.0.0.7/32")));
        assert!(restarted.is_pending(&net("10.0.0.9/32")));
        assert!(!is_blocked(&restarted, "10.0.0.7/32"));
        // still on disk for the next start
        let saved: Vec<BanRecord> = state.load().await.unwrap();
        assert!(saved.iter().any(|record| record.address == net("10.0.0.7/32")));
        assert!(saved.iter().any(|record| record.address == net("10.0.0.9/32")));
        assert_eq!(
            restarted.next_expiry(),
            Some(restarted_at + TimeDelta::seconds(5))
        );

        restarted.backend().fail(false);
        // too early for the retry
        restarted.expire(restarted_at + TimeDelta::seconds(2)).await;
        assert!(restarted.is_pending(&net("10.0.0.7/32")));

        restarted.expire(restarted_at + TimeDelta::seconds(5)).await;
        assert!(!restarted.is_pending(&net("10.0.0.7/32")));
        assert!(!restarted.is_pending(&net("10.0.0.9/32")));
        assert!(is_blocked(&restarted, "10.0.0.7/32"));
        assert!(is_blocked(&restarted, "10.0.0.9/32"));
        assert_eq!(
            restarted.get(&net("10.0.0.9/32")).unwrap().expires_at,
            Some(t0() + TimeDelta::seconds(300))
        );
    }

    #[tokio::test]
    async fn stale_ban_the_backend_refuses_is_lifted_later() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("bans.jsonl"));
        let mut restarted = saved_bans(&state).await;
        restarted.backend().fail(true);

        let restarted_at = t0() + TimeDelta::seconds(60);
        restarted.restore(restarted_at).await.unwrap();
        let stale = net("10.0.0.8/32");
        assert!(restarted.get(&stale).is_some());

        restarted.backend().fail(false);
        let lifted = restarted.expire(restarted_at + TimeDelta::seconds(5)).await;
        assert_eq!(lifted, vec![stale]);
        assert!(restarted.get(&stale).is_none());
        let saved: Vec<BanRecord> = state.load().await.unwrap();
        assert!(saved.iter().all(|record| record.address != stale));
        assert_eq!(saved.len(), 2);
    }

    #[tokio::test]
    async fn requests_for_pending_bans() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("bans.jsonl"));
        let mut restarted = saved_bans(&state).await;
        restarted.backend().fail(true);
        restarted.restore(t0() + TimeDelta::seconds(60)).await.unwrap();
        restarted.backend().fail(false);

        let address = net("10.0.0.7/32");
        let outcome = restarted
            .ban(BanRequest::permanent(address), t0() + TimeDelta::seconds(61))
            .await
            .unwrap();
        assert_eq!(outcome, BanOutcome::Applied);
        assert!(!restarted.is_pending(&address));
        assert_eq!(restarted.get(&address).unwrap().ref_count, 2);
        assert!(is_blocked(&restarted, "10.0.0.7/32"));

        let outcome = restarted.unban(address).await.unwrap();
        assert_eq!(outcome, UnbanOutcome::Released { ref_count: 1 });

        let outcome = restarted.unban(net("10.0.0.9/32")).await.unwrap();
        assert_eq!(outcome, UnbanOutcome::Removed);
        assert!(!restarted.is_pending(&net("10.0.0.9/32")));
        assert!(restarted.get(&net("10.0.0.9/32")).is_none());
        // only the stale removal is left to retry
        assert_eq!(
            restarted.next_expiry(),
            Some(t0() + TimeDelta::seconds(65))
        );
    }
}
