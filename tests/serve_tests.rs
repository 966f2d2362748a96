use assert_cmd::prelude::*;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use targeted_bfs::bloom::BloomFilter;
use targeted_bfs::pipes::make_pipe;
use targeted_bfs::seq_index::SeqIndex;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

/// Kills the server if a test panics mid-protocol.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + WAIT;
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", path);
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out waiting for server exit");
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_pipe(path: &Path) -> String {
    let mut content = String::new();
    File::open(path).unwrap().read_to_string(&mut content).unwrap();
    content
}

/// Two 32-base targets, one high-quality read supporting both.
fn setup_workdir() -> TempDir {
    let dir = TempDir::new().unwrap();

    let targets = dir.path().join("targets.fa");
    fs::write(
        &targets,
        ">T1\nACGTACGTACGTACGTACGTACGTACGTACGT\n>T2\nTTGGCCAATTGGCCAATTGGCCAATTGGCCAA\n",
    )
    .unwrap();
    let mapped = dir.path().join("mapped.fq");
    fs::write(
        &mapped,
        "@r\nACGTACGTACGTACGTACGTACGTACGTACGT\n+\nIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII\n",
    )
    .unwrap();
    fs::write(dir.path().join("map.tsv"), "r\tT1\t10\nr\tT2\t10\n").unwrap();

    let target_index = SeqIndex::build(&targets).unwrap();
    target_index.save(&dir.path().join("targets.fai")).unwrap();
    let mapped_index = SeqIndex::build(&mapped).unwrap();
    mapped_index.save(&dir.path().join("mapped.fqi")).unwrap();

    dir
}

fn serve_cmd(dir: &TempDir, bf_bytes: &str) -> Command {
    let mut cmd = Command::cargo_bin("targeted-bfs").unwrap();
    cmd.current_dir(dir.path())
        .args(["serve", "--target-seqs", "targets.fa"])
        .args(["--target-index", "targets.fai"])
        .args(["--mappings", "map.tsv"])
        .args(["--mapped-seqs", "mapped.fq"])
        .args(["--mapped-index", "mapped.fqi"])
        .args(["--subsample-max-per-10kbp", "10000"])
        .args(["--cbf-bytes", "4096", "--bf-bytes", bf_bytes])
        .args(["-k", "4", "-t", "2"]);
    cmd
}

fn spawn_server(dir: &TempDir) -> ChildGuard {
    ChildGuard(serve_cmd(dir, "1024").spawn().unwrap())
}

#[test]
fn sentinel_only_exits_cleanly() {
    let dir = setup_workdir();
    let mut server = spawn_server(&dir);

    let name_pipe = dir.path().join("batch_name_input");
    let ready_pipe = dir.path().join("batch_target_ids_input_ready");
    wait_for_path(&name_pipe);
    wait_for_path(&ready_pipe);

    fs::write(&name_pipe, "x\n").unwrap();

    let status = wait_for_exit(&mut server.0);
    assert!(status.success());
    assert!(!name_pipe.exists());
    assert!(!ready_pipe.exists());
}

#[test]
fn single_batch_round_trip() {
    let dir = setup_workdir();
    let mut server = spawn_server(&dir);

    let name_pipe = dir.path().join("batch_name_input");
    let ready_pipe = dir.path().join("batch_target_ids_input_ready");
    wait_for_path(&name_pipe);

    // Submit batch B; the server acknowledges once the per-batch FIFOs exist.
    fs::write(&name_pipe, "B\n").unwrap();
    assert_eq!(read_pipe(&ready_pipe), "1\n");

    let target_ids_pipe = dir.path().join("B-target_ids_input");
    let bfs_ready_pipe = dir.path().join("B-bfs_ready");
    assert!(target_ids_pipe.exists());
    assert!(bfs_ready_pipe.exists());

    // Stream the batch's targets, end with the sentinel, await completion.
    fs::write(&target_ids_pipe, "T1 T2 x\n").unwrap();
    assert_eq!(read_pipe(&bfs_ready_pipe), "1\n");

    let bf_path = dir.path().join("B-k4.bf");
    assert!(bf_path.exists());
    let bf = BloomFilter::load(&bf_path).unwrap();
    assert_eq!(bf.size_bytes(), 1024);
    assert_eq!(bf.hash_num(), 4);
    assert_eq!(bf.k(), 4);

    fs::write(&name_pipe, "x\n").unwrap();
    let status = wait_for_exit(&mut server.0);
    assert!(status.success());

    assert!(!name_pipe.exists());
    assert!(!ready_pipe.exists());
    assert!(!target_ids_pipe.exists());
    assert!(!bfs_ready_pipe.exists());
}

#[test]
fn unknown_and_unmapped_targets_are_skipped() {
    let dir = setup_workdir();
    let mut server = spawn_server(&dir);

    let name_pipe = dir.path().join("batch_name_input");
    let ready_pipe = dir.path().join("batch_target_ids_input_ready");
    wait_for_path(&name_pipe);

    fs::write(&name_pipe, "C\n").unwrap();
    assert_eq!(read_pipe(&ready_pipe), "1\n");

    // Neither a target missing from the index nor one with no supporters is
    // fatal; the batch still completes.
    fs::write(dir.path().join("C-target_ids_input"), "NOSUCH T1 x\n").unwrap();
    assert_eq!(read_pipe(&dir.path().join("C-bfs_ready")), "1\n");
    assert!(dir.path().join("C-k4.bf").exists());

    fs::write(&name_pipe, "x\n").unwrap();
    assert!(wait_for_exit(&mut server.0).success());
}

#[test]
fn zero_filter_size_fails_before_serving() {
    let dir = setup_workdir();

    // Rejected at argument validation, before any FIFO exists, with the
    // structured-error exit rather than an abort.
    let output = serve_cmd(&dir, "0").output().unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid argument"));
    assert!(!dir.path().join("batch_name_input").exists());
    assert!(!dir.path().join("batch_target_ids_input_ready").exists());
}

#[test]
fn hold_writes_rendezvous_byte() {
    let dir = TempDir::new().unwrap();
    let fifo: PathBuf = dir.path().join("lifeline");
    make_pipe(&fifo).unwrap();

    let mut cmd = Command::cargo_bin("targeted-bfs").unwrap();
    let mut child = cmd.arg("hold").arg(&fifo).spawn().unwrap();

    assert_eq!(read_pipe(&fifo), "1");
    assert!(wait_for_exit(&mut child).success());
}
