#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::time::{self, Duration, Instant};

    use crate::config::SchedulerConfig;
    use crate::flags::{ControlChannel, Flag, MemoryControl};
    use crate::session::{SessionLog, SessionScheduler};
    use crate::test_helpers::FakeRunner;

    fn config(dir: &Path, lambda: f64) -> SchedulerConfig {
        SchedulerConfig::new(1, lambda, dir.join("session_log.json"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_wait_for_ready() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.run.set(true);

        let active = control.active_flag(1);
        let runner = FakeRunner::new()
            .with_duration(Duration::from_secs(4))
            .observing(active.clone())
            .stopping(control.run.clone(), 3);

        let ready = control.ready.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(30)).await;
            ready.set(true);
        });

        let t0 = Instant::now();
        let mut scheduler = SessionScheduler::new(config(dir.path(), 1.0), runner.clone(), &control).unwrap();
        assert_eq!(scheduler.run().await.unwrap(), 3);

        let sessions = runner.sessions();
        assert_eq!(sessions.len(), 3);
        for s in &sessions {
            assert!(s.started >= t0 + Duration::from_secs(30), "session started before ready");
            assert!(s.active_during, "active flag not raised during session");
            assert_eq!(s.request.unit, 1);
        }
        assert!(!active.read());

        let log = SessionLog::load_or_default(&dir.path().join("session_log.json"));
        assert_eq!(log.sessions.len(), 3);
        assert_eq!(log.node_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cleared_mid_sleep_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.run.set(true);
        control.ready.set(true);

        // A twin with the same unit and seed draws the delay the scheduler
        // will sleep; pick a seed whose first delay is comfortably long.
        let draw_first = |seed| {
            let mut cfg = config(dir.path(), 0.01);
            cfg.experiment_seed = Some(seed);
            SessionScheduler::new(cfg, FakeRunner::new(), &control)
                .unwrap()
                .sample_delay()
        };
        let (seed, first_delay) = (0..100)
            .map(|seed| (seed, draw_first(seed)))
            .find(|(_, delay)| *delay > 1.0)
            .unwrap();

        let run = control.run.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs_f64(first_delay / 2.0)).await;
            run.set(false);
        });

        let runner = FakeRunner::new();
        let mut cfg = config(dir.path(), 0.01);
        cfg.experiment_seed = Some(seed);
        let t0 = Instant::now();
        let mut scheduler = SessionScheduler::new(cfg, runner.clone(), &control).unwrap();
        assert_eq!(scheduler.run().await.unwrap(), 0);

        assert!(t0.elapsed() < Duration::from_secs_f64(first_delay));
        assert!(runner.sessions().is_empty());
        assert!(!control.active_flag(1).read());

        let log = scheduler.log();
        assert_eq!(log.sessions.len(), 1);
        assert_eq!(log.sessions[0].sleep_duration, first_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cleared_while_waiting_for_ready() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.run.set(true);

        let run = control.run.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(5)).await;
            run.set(false);
        });

        let runner = FakeRunner::new();
        let mut scheduler = SessionScheduler::new(config(dir.path(), 1.0), runner.clone(), &control).unwrap();
        assert_eq!(scheduler.run().await.unwrap(), 0);
        assert!(runner.sessions().is_empty());
        assert!(scheduler.log().sessions.is_empty());
        assert!(!dir.path().join("session_log.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_failures_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.run.set(true);
        control.ready.set(true);

        let runner = FakeRunner::new().failing().stopping(control.run.clone(), 3);
        let mut scheduler = SessionScheduler::new(config(dir.path(), 2.0), runner.clone(), &control).unwrap();

        assert_eq!(scheduler.run().await.unwrap(), 3);
        assert_eq!(runner.sessions().len(), 3);
        assert!(!control.active_flag(1).read());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_id_recorded_once_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.ready.set(true);

        for _ in 0..2 {
            control.run.set(true);
            let mut cfg = config(dir.path(), 1.0);
            cfg.node_id = Some(42);
            let runner = FakeRunner::new().stopping(control.run.clone(), 2);
            let mut scheduler = SessionScheduler::new(cfg, runner, &control).unwrap();
            scheduler.run().await.unwrap();
        }

        let path = dir.path().join("session_log.json");
        let log = SessionLog::load_or_default(&path);
        assert_eq!(log.node_id, Some(42));
        assert_eq!(log.sessions.len(), 4);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.matches("\"node_id\"").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_variants_reach_runner_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let control = MemoryControl::new();
        control.run.set(true);
        control.ready.set(true);

        let mut cfg = config(dir.path(), 1.0);
        cfg.bandwidth_range = Some((500, 4000));
        cfg.contents = vec!["http://cdn/a.mpd".into(), "http://cdn/b.mpd".into()];
        let runner = FakeRunner::new().stopping(control.run.clone(), 5);
        let mut scheduler = SessionScheduler::new(cfg, runner.clone(), &control).unwrap();
        scheduler.run().await.unwrap();

        let sessions = runner.sessions();
        let log = scheduler.log();
        assert_eq!(sessions.len(), 5);
        for (session, entry) in sessions.iter().zip(&log.sessions) {
            let bw = session.request.bandwidth_kbps.unwrap();
            assert!((500..=4000).contains(&bw));
            assert_eq!(entry.bandwidth_kbps, Some(bw));
            assert_eq!(entry.content, session.request.content);
            assert!(entry.content.as_deref().unwrap().starts_with("http://cdn/"));
        }
    }
}
