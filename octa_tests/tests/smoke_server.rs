use std::time::Duration;

use octa_server::server::bind_ephemeral;
use octa_shared::math::Vec3;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.start_scenario("smoke");
    server.run_for_ticks(3).await?;
    Ok(())
}

/// A client that connects and then says nothing must not stall the
/// accept path; its handshake times out and the slot is refused.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_cannot_stall_accept() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.start_scenario("smoke");
    let addr: std::net::SocketAddr = cfg.server_addr.parse()?;
    let _mute = tokio::net::TcpStream::connect(addr).await?;
    let accepted = tokio::time::timeout(
        Duration::from_secs(20),
        server.try_accept(Duration::from_millis(100)),
    )
    .await
    .expect("accept must give up on a silent client");
    assert!(accepted.is_err(), "silent handshake must be refused");
    assert_eq!(server.client_count(), 0);
    Ok(())
}

/// Console commands work with no clients attached.
#[tokio::test]
async fn console_status_reports_entities() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.start_scenario("smoke");
    server
        .session_mut()
        .core_mut()
        .create_entity("light", Vec3::new(100.0, 100.0, 100.0), "{}", "")?;
    let out = server.exec_console("status")?;
    assert!(out.iter().any(|l| l.contains("entities: 1")));
    server.step().await?;
    Ok(())
}
