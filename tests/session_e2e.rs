//! End-to-end tests for the shell server.
//!
//! Each test starts a real server on a localhost port, connects raw TCP
//! clients, and checks the exact text they receive.

mod common;

use common::{start_server, start_server_with, TestServer};

const BANNER: &str = "\
****************************************
** Welcome to the information server. **
****************************************
";

fn join_notice(port: u16) -> String {
    format!("*** User '(no name)' entered from 127.0.0.1/{port}. ***\n")
}

/// Join two clients and drain the second one's join notice from the first.
async fn two_clients(server: &TestServer) -> (common::TestClient, common::TestClient) {
    let mut a = server.join().await;
    let b = server.join().await;
    a.read_until(&join_notice(b.local_port())).await;
    (a, b)
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_welcome_sequence() {
    let server = start_server().await;
    let mut client = server.connect().await;
    let welcome = client.read_until("% ").await;
    assert_eq!(
        welcome,
        format!("{BANNER}{}% ", join_notice(client.local_port()))
    );
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_exit_closes_and_announces_leave() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;

    b.send("exit").await;
    assert_eq!(b.read_to_end().await, "*** User '(no name)' left. ***\n");
    assert_eq!(a.read_until("left. ***\n").await, "*** User '(no name)' left. ***\n");
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_disconnect_releases_smallest_id() {
    let server = start_server().await;
    let (mut a, b) = two_clients(&server).await;
    let mut c = server.join().await;
    a.read_until(&join_notice(c.local_port())).await;

    drop(b);
    a.read_until("left. ***\n").await;
    c.read_until("left. ***\n").await;

    let mut d = server.join().await;
    let who = d.run("who").await;
    let me = format!("2\t(no name)\t127.0.0.1/{}\t<-me\n", d.local_port());
    assert!(who.contains(&me), "unexpected who output {who:?}");
}

#[tokio::test]
async fn test_server_full_refuses_connection() {
    let server = start_server_with(|c| c.max_users = 1).await;
    let _a = server.join().await;

    let mut b = server.connect().await;
    assert_eq!(
        b.read_to_end().await,
        format!("{BANNER}*** Error: server is full. ***\n")
    );
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = start_server().await;
    let mut a = server.join().await;
    server.cancel.cancel();
    assert_eq!(a.read_to_end().await, "*** User '(no name)' left. ***\n");
}

#[tokio::test]
async fn test_shutdown_waits_for_running_command() {
    let mut server = start_server().await;
    let mut a = server.join().await;

    a.send("sleep 1").await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    server.shutdown().await;

    // `serve` only returns once the session has finished its command and left.
    assert!(server.registry.is_empty());
    assert_eq!(a.read_to_end().await, "% *** User '(no name)' left. ***\n");
}

// ── Command buffering ───────────────────────────────────────────────

#[tokio::test]
async fn test_command_split_across_writes() {
    let server = start_server().await;
    let mut a = server.join().await;
    a.send_raw(b"ec").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    a.send_raw(b"ho split\r\n").await;
    assert_eq!(a.read_until("% ").await, "split\n% ");
}

#[tokio::test]
async fn test_two_commands_in_one_write() {
    let server = start_server().await;
    let mut a = server.join().await;
    a.send_raw(b"echo one\necho two\n").await;
    assert_eq!(a.read_until("% ").await, "one\n% ");
    assert_eq!(a.read_until("% ").await, "two\n% ");
}

#[tokio::test]
async fn test_overflow_resets_buffer() {
    let server = start_server_with(|c| c.max_command_size = 16).await;
    let mut a = server.join().await;
    a.send(&"x".repeat(40)).await;
    assert_eq!(
        a.read_until("% ").await,
        "*** Error: command too long (max 16 bytes). ***\n% "
    );
    assert_eq!(a.run("echo ok").await, "ok\n");
}

#[tokio::test]
async fn test_empty_line_reprompts() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("").await, "");
}

// ── Internal commands ───────────────────────────────────────────────

#[tokio::test]
async fn test_environment_is_per_session() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;

    assert_eq!(a.run("printenv PATH").await, "PATH=/bin:/usr/bin\n");
    assert_eq!(a.run("setenv FOO bar").await, "");
    assert_eq!(a.run("printenv FOO").await, "FOO=bar\n");
    assert_eq!(b.run("printenv FOO").await, "");
    assert_eq!(
        a.run("setenv FOO").await,
        "Usage: setenv [variable name] [value to assign].\n"
    );
}

#[tokio::test]
async fn test_setenv_path_controls_lookup() {
    let server = start_server().await;
    let mut a = server.join().await;
    a.run("setenv PATH /nonexistent").await;
    assert_eq!(a.run("ls").await, "Unknown command: [ls].\n");
}

// ── Chat ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_name_is_broadcast_and_unique() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;

    let notice = format!(
        "*** User from 127.0.0.1/{} is named 'alice'. ***\n",
        a.local_port()
    );
    assert_eq!(a.run("name alice").await, notice);
    assert_eq!(b.read_until("'alice'. ***\n").await, notice);

    assert_eq!(b.run("name alice").await, "*** User 'alice' already exists. ***\n");
}

#[tokio::test]
async fn test_tell_and_yell() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;
    a.run("name alice").await;
    b.read_until("'alice'. ***\n").await;

    assert_eq!(a.run("tell 2 hi | there").await, "");
    assert_eq!(
        b.read_until("there\n").await,
        "*** alice told you ***: hi | there\n"
    );
    assert_eq!(
        a.run("tell 7 anyone").await,
        "*** Error: user #7 does not exist yet. ***\n"
    );

    let yell = "*** (no name) yelled ***: good morning\n";
    assert_eq!(b.run("yell good morning").await, yell);
    assert_eq!(a.read_until("morning\n").await, yell);
}

#[tokio::test]
async fn test_who_lists_sessions_by_id() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;
    b.run("name bob").await;
    a.read_until("'bob'. ***\n").await;

    assert_eq!(
        a.run("who").await,
        format!(
            "<ID>\t<nickname>\t<IP/port>\t<indicate me>\n\
             1\t(no name)\t127.0.0.1/{}\t<-me\n\
             2\tbob\t127.0.0.1/{}\n",
            a.local_port(),
            b.local_port()
        )
    );
}

// ── Pipelines ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_pipeline_output() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("echo hello world | tr a-z A-Z | cat").await, "HELLO WORLD\n");
}

#[tokio::test]
async fn test_pipeline_stops_on_error() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("false | touch spawned").await, "");
    assert!(!server.dir.path().join("spawned").exists());
    assert_eq!(
        a.run("no-such-cmd | touch spawned").await,
        "Unknown command: [no-such-cmd].\n"
    );
    assert!(!server.dir.path().join("spawned").exists());
}

#[tokio::test]
async fn test_failed_stage_keeps_its_stdout_in_the_chain() {
    let server = start_server().await;
    let mut a = server.join().await;
    std::fs::write(
        server.dir.path().join("fail.sh"),
        "echo out\necho err >&2\nexit 3\n",
    )
    .unwrap();

    assert_eq!(a.run("sh fail.sh | touch spawned").await, "err\n");
    assert!(!server.dir.path().join("spawned").exists());

    // The failed line did not advance the chain: its stdout still waits one
    // line ahead of the next command.
    assert_eq!(a.run("cat").await, "");
    assert_eq!(a.run("cat").await, "out\n");
}

#[tokio::test]
async fn test_endless_output_is_cut_off() {
    let server = start_server_with(|c| c.output_limit = 4096).await;
    let mut a = server.join().await;
    assert_eq!(
        a.run("yes").await,
        format!("{}*** Error: output exceeded 4096 bytes. ***\n", "y\n".repeat(2048))
    );
    assert_eq!(
        a.run("yes |1").await,
        "*** Error: pipe output exceeded 4096 bytes. ***\n"
    );
    assert_eq!(a.run("echo still here").await, "still here\n");
}

#[tokio::test]
async fn test_numbered_pipe_reaches_later_line() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("echo first |2").await, "");
    assert_eq!(a.run("echo second |1").await, "");
    assert_eq!(a.run("cat").await, "first\nsecond\n");
}

#[tokio::test]
async fn test_numbered_pipe_survives_unknown_command() {
    let server = start_server().await;
    let mut a = server.join().await;
    a.run("echo kept |1").await;
    assert_eq!(a.run("nope").await, "Unknown command: [nope].\n");
    assert_eq!(a.run("wc -l").await.trim(), "1");
}

#[tokio::test]
async fn test_file_redirection() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("echo saved > out.txt").await, "");
    assert_eq!(
        std::fs::read_to_string(server.dir.path().join("out.txt")).unwrap(),
        "saved\n"
    );
    assert_eq!(a.run("cat < out.txt").await, "saved\n");

    let missing = a.run("cat < missing.txt").await;
    assert!(missing.starts_with("*** Error: cannot open '"), "{missing:?}");
}

#[tokio::test]
async fn test_ambiguous_input_redirection() {
    let server = start_server().await;
    let mut a = server.join().await;
    std::fs::write(server.dir.path().join("in.txt"), "file\n").unwrap();

    a.run("echo piped |1").await;
    assert_eq!(
        a.run("cat < in.txt").await,
        "*** Error: ambiguous input redirection. ***\n"
    );
    // The pending pipe is still there for a plain reader.
    assert_eq!(a.run("cat").await, "piped\n");
}

#[tokio::test]
async fn test_parse_error_is_reported() {
    let server = start_server().await;
    let mut a = server.join().await;
    assert_eq!(a.run("ls >").await, "*** Error: missing target after '>'. ***\n");
}

// ── User pipes ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_user_pipe_between_sessions() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;

    let sent = "*** (no name) (#1) just piped 'echo hello >2' to (no name) (#2) ***\n";
    assert_eq!(a.run("echo hello >2").await, sent);
    assert_eq!(b.read_until("(#2) ***\n").await, sent);

    assert_eq!(
        a.run("echo again >2").await,
        "*** Error: the pipe #1->#2 already exists. ***\n"
    );

    let received = "*** (no name) (#2) just received from (no name) (#1) by 'cat <1' ***\n";
    assert_eq!(b.run("cat <1").await, format!("{received}hello\n"));
    assert_eq!(a.read_until("'cat <1' ***\n").await, received);

    assert_eq!(
        b.run("cat <1").await,
        "*** Error: the pipe #1->#2 does not exist yet. ***\n"
    );
    assert_eq!(
        a.run("echo x >9").await,
        "*** Error: user #9 does not exist yet. ***\n"
    );
}

#[tokio::test]
async fn test_user_pipe_discarded_when_sender_leaves() {
    let server = start_server().await;
    let (mut a, mut b) = two_clients(&server).await;

    a.run("echo lost >2").await;
    b.read_until("(#2) ***\n").await;
    a.send("exit").await;
    a.read_to_end().await;
    b.read_until("left. ***\n").await;

    assert_eq!(
        b.run("cat <1").await,
        "*** Error: user #1 does not exist yet. ***\n"
    );
}
