#![cfg(unix)]

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parsync_core::{
    SPAWN_FAILED_EXIT_CODE, ThrottleConfig, TransferConfig, TransferOptions, TransferTask,
    run_parallel_transfer_with,
};
use tempfile::TempDir;

const DESTINATION: &str = "rsync://backup.local/module/";

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// Writes an executable stand-in for rsync. It appends its arguments to `calls.log`, reports the
/// combined size of its `./` sources as one progress line and exits with `exit_code`.
fn fake_rsync(dir: &Path, exit_code: i32) -> PathBuf {
    let log = dir.join("calls.log");
    let script = format!(
        r#"#!/bin/sh
echo "$@" >> "{log}"
total=0
for arg in "$@"; do
  case "$arg" in
    ./*) size=$(wc -c < "$arg"); total=$((total + size)) ;;
  esac
done
printf '          0   0%%    0.00kB/s    0:00:00\r'
printf '%12d 100%%    1.00MB/s    0:00:01\n' "$total"
exit {exit_code}
"#,
        log = log.display(),
    );
    let path = dir.join("fake-rsync");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("script.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn hundred_files_are_split_across_tasks_and_all_transferred() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    let bin = temp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();

    let mut expected_bytes = 0u64;
    for i in 0..100 {
        let size = 100 + i * 37;
        expected_bytes += size as u64;
        write_file(source.join(format!("d{}/f{i:03}.bin", i % 7)), &vec![b'x'; size]);
    }

    let mut config = TransferConfig::new(&source, DESTINATION);
    config.program = Some(fake_rsync(&bin, 0));
    config.max_procs = 4;
    config.options = TransferOptions {
        progress: true,
        compress: true,
    };
    config.progress_interval = Duration::from_millis(20);

    let out = SharedBuf::default();
    let report = run_parallel_transfer_with(config, out.clone()).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.exit_codes);
    assert_eq!(report.exit_codes, vec![0; 4]);
    assert_eq!(report.summary.files, 100);
    assert_eq!(report.summary.total_bytes, expected_bytes);
    assert_eq!(report.summary.tasks, 4);
    assert_eq!(report.summary.failed_tasks, 0);

    let calls = calls(&bin);
    assert_eq!(calls.len(), 4);
    let mut seen: HashMap<String, usize> = HashMap::new();
    for call in &calls {
        assert!(call.starts_with("-av -R --info=progress2 -z ./"), "{call}");
        assert!(call.ends_with(DESTINATION), "{call}");
        for arg in call.split_whitespace().filter(|a| a.starts_with("./")) {
            *seen.entry(arg.to_string()).or_default() += 1;
        }
    }
    assert_eq!(seen.len(), 100);
    assert!(seen.values().all(|n| *n == 1));
    assert!(seen.contains_key("./d3/f010.bin"));

    let progress = out.text();
    assert!(progress.starts_with("\r[progress]"), "{progress:?}");
    assert!(progress.ends_with('\n'), "{progress:?}");
}

#[tokio::test]
async fn failing_tasks_are_reported_without_aborting_the_run() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    let bin = temp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    for i in 0..5 {
        write_file(source.join(format!("f{i}")), b"payload");
    }

    let mut config = TransferConfig::new(&source, DESTINATION);
    config.program = Some(fake_rsync(&bin, 23));
    config.max_procs = 2;

    let report = run_parallel_transfer_with(config, std::io::sink())
        .await
        .unwrap();
    assert!(!report.succeeded());
    assert_eq!(report.exit_codes, vec![23, 23]);
    assert_eq!(report.summary.failed_tasks, 2);
    assert_eq!(calls(&bin).len(), 2);
    assert!(calls(&bin).iter().all(|c| !c.contains("--info=progress2")));
}

#[tokio::test]
async fn missing_program_marks_every_task_failed() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    write_file(source.join("a"), b"a");
    write_file(source.join("b"), b"b");

    let mut config = TransferConfig::new(&source, DESTINATION);
    config.program = Some(temp.path().join("no-such-rsync"));
    config.max_procs = 8;

    let report = run_parallel_transfer_with(config, std::io::sink())
        .await
        .unwrap();
    assert_eq!(report.exit_codes, vec![SPAWN_FAILED_EXIT_CODE; 2]);
}

#[tokio::test]
async fn throttled_run_still_completes() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    let bin = temp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    for i in 0..3 {
        write_file(source.join(format!("f{i}")), b"data");
    }

    let mut config = TransferConfig::new(&source, DESTINATION);
    config.program = Some(fake_rsync(&bin, 0));
    config.max_procs = 3;
    config.throttle = Some(ThrottleConfig {
        suspend_threshold: 100.0,
        resume_threshold: 99.0,
        interval: Duration::from_millis(10),
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run_parallel_transfer_with(config, std::io::sink()),
    )
    .await
    .expect("run hung")
    .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.summary.total_bytes, 12);
}

#[tokio::test]
async fn task_reports_rsync_progress_and_exit_code() {
    let temp = TempDir::new().unwrap();
    let program = script(
        temp.path(),
        r#"printf '  1,234,567   10%%   1.23MB/s    0:00:12\r'
exit 1"#,
    );

    let task = TransferTask::new(
        vec![temp.path().join("a.txt")],
        DESTINATION,
        temp.path(),
        TransferOptions::default(),
    )
    .with_program(&program);

    let seen = Mutex::new(Vec::new());
    let on_progress = |bytes: u64| seen.lock().unwrap().push(bytes);
    let code = task.run(Some(&on_progress)).await.unwrap();

    assert_eq!(code, 1);
    assert_eq!(*seen.lock().unwrap(), vec![1_234_567]);
}

#[tokio::test]
async fn task_runs_in_the_base_directory() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    write_file(base.join("marker"), b"");
    let program = script(temp.path(), r#"test -f ./marker && test "$3" = ./marker"#);

    let task = TransferTask::new(
        vec![base.join("marker")],
        DESTINATION,
        &base,
        TransferOptions::default(),
    )
    .with_program(&program);
    assert_eq!(task.run(None).await.unwrap(), 0);
}
