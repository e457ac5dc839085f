use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, Months, Utc};
use chrono_tz::Tz;
use color_eyre::Result;
use log::{debug, error, info, warn};

use crate::archive::{ARCHIVE_PATH, Comparison, TrainArchive};
use crate::config::Config;
use crate::source;
use crate::train::{ROME, Train};

const RUN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The delivery side of the bot, kept abstract so the loop can be exercised
/// without Telegram. A returned id of 0 means "not actually delivered".
pub trait Notifier {
    fn create(&mut self, train: &Train) -> Result<i64>;
    fn update(&mut self, train: &Train, message_id: i64) -> Result<()>;
}

/// Upper bound on how far in the future a train may be before it is ignored.
#[derive(Debug, Clone, Copy)]
pub struct Horizon {
    pub years: i64,
    pub months: i64,
    pub days: i64,
}

impl Horizon {
    /// The latest acceptable date, `None` when the horizon is unbounded:
    /// any negative component is the sentinel for "no upper bound", and a
    /// horizon too large to represent is unbounded in practice.
    pub fn limit(&self, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
        if self.years < 0 || self.months < 0 || self.days < 0 {
            return None;
        }
        let months = self
            .years
            .checked_mul(12)
            .and_then(|m| m.checked_add(self.months))
            .and_then(|m| u32::try_from(m).ok())?;
        now.checked_add_months(Months::new(months))
            .and_then(|d| d.checked_add_days(Days::new(self.days as u64)))
    }
}

impl From<&Config> for Horizon {
    fn from(cfg: &Config) -> Self {
        Self {
            years: cfg.horizon_years,
            months: cfg.horizon_months,
            days: cfg.horizon_days,
        }
    }
}

pub struct RunOptions {
    pub horizon: Horizon,
    /// Treat every train as changed, for administrative re-broadcasts.
    pub force_update: bool,
    /// Injected reference time for deterministic runs; wall clock when unset.
    pub fake_now: Option<DateTime<Tz>>,
}

impl RunOptions {
    fn now(&self) -> DateTime<Tz> {
        match self.fake_now {
            Some(now) => {
                info!("Faking execution time as {now}");
                now
            }
            None => Utc::now().with_timezone(&ROME),
        }
    }
}

/// One reconciliation pass over the scraped trains, in source order.
///
/// Every per-train failure is logged and skipped; nothing aborts the pass.
/// The archive is mutated in memory only, the caller persists it afterwards.
pub fn reconcile(
    trains: &[Train],
    archive: &mut TrainArchive,
    notifier: &mut dyn Notifier,
    opts: &RunOptions,
) {
    let now = opts.now();
    let limit = opts.horizon.limit(now);

    if opts.force_update {
        warn!("Force updating trains");
    }

    for train in trains {
        let id = train.unique_id();
        if id.is_empty() {
            warn!("Skipping train without a link: {train}");
            continue;
        }

        let when = match train.when() {
            Ok(when) => when,
            Err(err) => {
                error!("Cannot get train date for {train}: {err:#}");
                continue;
            }
        };

        if when < now {
            debug!("Skipping train {train}, in the past: {when}");
            continue;
        }
        if let Some(limit) = limit {
            if when > limit {
                debug!("Skipping train {train}, too far in the future: {when}");
                continue;
            }
        }

        let mut action = archive.compare(train);
        if opts.force_update {
            action = Comparison::Changed;
        }

        match action {
            Comparison::Unchanged => {
                debug!("Skipping train, already sent: {train}");
            }
            Comparison::Changed => {
                let message_id = archive.message_id(&id);
                if message_id == 0 {
                    // the original send was a dry run, there is nothing to edit
                    info!("Skipping update of train sent dry: {train}");
                    continue;
                }
                info!("Changing train: {train}");
                match notifier.update(train, message_id) {
                    Ok(()) => archive.record(&id, message_id, train.fingerprint()),
                    Err(err) => error!("Cannot change train {train}: {err:#}"),
                }
            }
            Comparison::NotTracked => {
                info!("Sending train: {train} ({when})");
                match notifier.create(train) {
                    Ok(message_id) => archive.record(&id, message_id, train.fingerprint()),
                    Err(err) => error!("Cannot send train {train}: {err:#}"),
                }
            }
        }
    }
}

/// One scheduling tick: fetch, reconcile, persist. Never returns an error so
/// the scheduler always fires the next tick.
pub fn run_once(
    archive: &mut TrainArchive,
    notifier: &mut dyn Notifier,
    opts: &RunOptions,
    load_trains: impl FnOnce() -> Result<Vec<Train>>,
    archive_path: &Path,
) {
    info!("Running, {} trains archived", archive.len());

    match load_trains() {
        Ok(trains) => reconcile(&trains, archive, notifier, opts),
        Err(err) => error!("Cannot load trains: {err:#}"),
    }

    // a write that failed on an earlier tick is retried even when the
    // fetch fails this tick
    if archive.dirty() {
        info!("Saving archive");
        if let Err(err) = archive.save_to_file(archive_path) {
            error!("Cannot save archive: {err:#}");
        }
    }

    info!("Done running");
}

/// Fixed-interval schedule. Runs never overlap; an overrunning tick simply
/// delays the next one, with no catch-up.
pub fn run_forever(
    mut archive: TrainArchive,
    mut notifier: impl Notifier,
    opts: RunOptions,
) -> ! {
    loop {
        let started = Instant::now();
        run_once(
            &mut archive,
            &mut notifier,
            &opts,
            source::load_trains,
            Path::new(ARCHIVE_PATH),
        );
        if let Some(remaining) = RUN_INTERVAL.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use color_eyre::eyre::eyre;

    #[derive(Default)]
    struct MockNotifier {
        created: Vec<String>,
        updated: Vec<(String, i64)>,
        next_id: i64,
        fail_create: bool,
        fail_update: bool,
    }

    impl Notifier for MockNotifier {
        fn create(&mut self, train: &Train) -> Result<i64> {
            if self.fail_create {
                return Err(eyre!("transport down"));
            }
            self.created.push(train.unique_id());
            Ok(self.next_id)
        }

        fn update(&mut self, train: &Train, message_id: i64) -> Result<()> {
            if self.fail_update {
                return Err(eyre!("transport down"));
            }
            self.updated.push((train.unique_id(), message_id));
            Ok(())
        }
    }

    fn train(id: &str, date: &str) -> Train {
        Train {
            title: format!("Treno {id}"),
            link: format!("/content/fondazionefs/it/treni-storici/{id}.html"),
            date: date.into(),
            ..Train::default()
        }
    }

    fn opts() -> RunOptions {
        RunOptions {
            horizon: Horizon {
                years: 0,
                months: 1,
                days: 0,
            },
            force_update: false,
            fake_now: Some(ROME.with_ymd_and_hms(2030, 5, 1, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn new_train_is_created_and_recorded() {
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier {
            next_id: 77,
            ..MockNotifier::default()
        };

        reconcile(&[t.clone()], &mut archive, &mut bot, &opts());

        assert_eq!(bot.created, vec!["2030/05/10/x"]);
        assert_eq!(archive.message_id("2030/05/10/x"), 77);
        assert_eq!(archive.compare(&t), Comparison::Unchanged);
        assert!(archive.dirty());
    }

    #[test]
    fn unchanged_train_triggers_no_call() {
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        archive.record(&t.unique_id(), 42, t.fingerprint());
        let mut bot = MockNotifier::default();

        reconcile(&[t], &mut archive, &mut bot, &opts());

        assert!(bot.created.is_empty());
        assert!(bot.updated.is_empty());
    }

    #[test]
    fn changed_train_is_updated_with_its_handle() {
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        archive.record(&t.unique_id(), 42, "stale".into());
        let mut bot = MockNotifier::default();

        reconcile(&[t.clone()], &mut archive, &mut bot, &opts());

        assert_eq!(bot.updated, vec![("2030/05/10/x".to_string(), 42)]);
        assert_eq!(archive.message_id("2030/05/10/x"), 42);
        assert_eq!(archive.compare(&t), Comparison::Unchanged);
    }

    #[test]
    fn failed_update_leaves_the_archive_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trains.hash");

        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        archive.record(&t.unique_id(), 42, "stale".into());
        archive.save_to_file(&path).unwrap();

        let mut bot = MockNotifier {
            fail_update: true,
            ..MockNotifier::default()
        };
        reconcile(&[t.clone()], &mut archive, &mut bot, &opts());

        assert!(!archive.dirty());
        assert_eq!(archive.compare(&t), Comparison::Changed);
    }

    #[test]
    fn failed_create_is_retried_as_not_tracked() {
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier {
            fail_create: true,
            ..MockNotifier::default()
        };

        reconcile(&[t.clone()], &mut archive, &mut bot, &opts());

        assert!(!archive.contains(&t.unique_id()));
        assert_eq!(archive.compare(&t), Comparison::NotTracked);
        assert!(!archive.dirty());
    }

    #[test]
    fn changed_train_sent_dry_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        archive.record(&t.unique_id(), 0, "stale".into());
        archive.save_to_file(dir.path().join("trains.hash")).unwrap();
        let mut bot = MockNotifier::default();

        reconcile(&[t], &mut archive, &mut bot, &opts());

        assert!(bot.updated.is_empty());
        assert!(!archive.dirty());
        assert_eq!(archive.message_id("2030/05/10/x"), 0);
    }

    #[test]
    fn force_update_overrides_unchanged() {
        let t = train("2030/05/10/x", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        archive.record(&t.unique_id(), 42, t.fingerprint());
        let mut bot = MockNotifier::default();

        let opts = RunOptions {
            force_update: true,
            ..opts()
        };
        reconcile(&[t], &mut archive, &mut bot, &opts);

        assert_eq!(bot.updated, vec![("2030/05/10/x".to_string(), 42)]);
    }

    #[test]
    fn past_trains_are_skipped() {
        let t = train("2030/04/20/x", "Apr 20, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();

        reconcile(&[t.clone()], &mut archive, &mut bot, &opts());

        assert!(bot.created.is_empty());
        assert!(!archive.contains(&t.unique_id()));
    }

    #[test]
    fn horizon_boundary_is_inclusive() {
        // fake now is 2030-05-01 00:00, one month horizon
        let at_now = train("2030/05/01/a", "May 1, 2030 12:00:00 AM");
        let at_limit = train("2030/06/01/b", "Jun 1, 2030 12:00:00 AM");
        let beyond = train("2030/06/02/c", "Jun 2, 2030 12:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();

        reconcile(
            &[at_now, at_limit, beyond],
            &mut archive,
            &mut bot,
            &opts(),
        );

        assert_eq!(bot.created, vec!["2030/05/01/a", "2030/06/01/b"]);
    }

    #[test]
    fn negative_horizon_means_unbounded() {
        let far = train("2099/01/01/x", "Jan 1, 2099 12:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();

        let opts = RunOptions {
            horizon: Horizon {
                years: -1,
                months: 1,
                days: 0,
            },
            ..opts()
        };
        reconcile(&[far], &mut archive, &mut bot, &opts);

        assert_eq!(bot.created, vec!["2099/01/01/x"]);
    }

    #[test]
    fn overflowing_horizon_is_treated_as_unbounded() {
        let now = ROME.with_ymd_and_hms(2030, 5, 1, 0, 0, 0).unwrap();
        let horizon = Horizon {
            years: i64::MAX,
            months: 0,
            days: 0,
        };
        assert!(horizon.limit(now).is_none());

        let far = train("2099/01/01/x", "Jan 1, 2099 12:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();
        let opts = RunOptions {
            horizon,
            ..opts()
        };
        reconcile(&[far], &mut archive, &mut bot, &opts);
        assert_eq!(bot.created, vec!["2099/01/01/x"]);
    }

    #[test]
    fn dirty_archive_is_saved_even_when_the_fetch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trains.hash");

        // a save failed on an earlier tick, the archive is still dirty
        let mut archive = TrainArchive::default();
        archive.record("2030/05/10/x", 42, "abc".into());
        let mut bot = MockNotifier::default();

        run_once(
            &mut archive,
            &mut bot,
            &opts(),
            || Err(eyre!("listing unreachable")),
            &path,
        );

        assert!(!archive.dirty());
        assert!(path.exists());
        assert!(bot.created.is_empty());
    }

    #[test]
    fn bad_date_skips_only_that_train() {
        let bad = train("2030/05/10/bad", "domani");
        let good = train("2030/05/10/good", "May 10, 2030 09:00:00 AM");
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();

        reconcile(&[bad, good], &mut archive, &mut bot, &opts());

        assert_eq!(bot.created, vec!["2030/05/10/good"]);
    }

    #[test]
    fn train_without_link_is_never_archived() {
        let mut t = train("x", "May 10, 2030 09:00:00 AM");
        t.link = String::new();
        let mut archive = TrainArchive::default();
        let mut bot = MockNotifier::default();

        reconcile(&[t], &mut archive, &mut bot, &opts());

        assert!(bot.created.is_empty());
        assert!(archive.is_empty());
    }
}
