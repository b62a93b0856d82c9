// ===============================
// src/client.rs (message pump + reconnect loop)
// ===============================
//
// run               : one connection's worth of work. Poll the session, wait up
//                     to `poll_timeout` for the gateway to say something, then
//                     dispatch everything queued.
// run_with_reconnect: fresh gateway + session per attempt, bounded attempts,
//                     fixed delay between them, Ctrl-C honoured while waiting.
//
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{sleep, Duration, Instant},
};
use tracing::{error, info, warn};

use crate::domain::GatewayEvent;
use crate::gateway::BrokerGateway;
use crate::metrics::RECONNECTS;
use crate::session::{Session, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Unsubscribe ran; nothing left to do.
    Halted,
    Disconnected,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ReconnectPlan {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub connect_options: Option<String>,
    /// Connection attempts over the whole process lifetime.
    pub attempts: u32,
    pub delay: Duration,
    pub poll_timeout: Duration,
}

pub async fn run<G: BrokerGateway + ?Sized>(
    session: &mut Session,
    gw: &mut G,
    events: &mut mpsc::UnboundedReceiver<GatewayEvent>,
    poll_timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionOutcome, SessionError> {
    let mut watch_shutdown = true;
    loop {
        if *shutdown.borrow() {
            info!(state = %session.state(), "shutdown requested");
            return Ok(SessionOutcome::Shutdown);
        }
        if !gw.is_connected() {
            return Ok(SessionOutcome::Disconnected);
        }

        session.poll(gw, Instant::now().into_std())?;
        if session.is_halted() {
            return Ok(SessionOutcome::Halted);
        }

        let first = select! {
            ev = events.recv() => ev,
            _ = sleep(poll_timeout) => continue,
            changed = shutdown.changed(), if watch_shutdown => {
                if changed.is_err() {
                    // no one left to ask for shutdown; keep pumping
                    warn!("shutdown sender dropped");
                    watch_shutdown = false;
                }
                continue;
            }
        };
        let Some(first) = first else {
            warn!("gateway event channel closed");
            return Ok(SessionOutcome::Disconnected);
        };

        let mut closed = false;
        let mut next = Some(first);
        while let Some(ev) = next {
            closed |= matches!(ev, GatewayEvent::ConnectionClosed);
            session.handle_event(gw, ev)?;
            next = events.try_recv().ok();
        }
        if closed {
            return Ok(SessionOutcome::Disconnected);
        }
    }
}

/// Returns `Disconnected` once every attempt is used up, and the error of the
/// first fatal session failure.
pub async fn run_with_reconnect<G, F, S>(
    plan: &ReconnectPlan,
    mut make_gateway: F,
    mut make_session: S,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionOutcome, SessionError>
where
    G: BrokerGateway,
    F: FnMut(mpsc::UnboundedSender<GatewayEvent>) -> G,
    S: FnMut() -> Session,
{
    for attempt in 1..=plan.attempts {
        if attempt > 1 {
            RECONNECTS.inc();
        }
        info!(attempt, max = plan.attempts, host = %plan.host, port = plan.port, "connecting");

        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let mut gw = make_gateway(ev_tx);
        if let Some(opts) = &plan.connect_options {
            gw.set_connect_options(opts);
        }

        if gw.connect(&plan.host, plan.port, plan.client_id) {
            let mut session = make_session();
            let outcome = run(&mut session, &mut gw, &mut ev_rx, plan.poll_timeout, shutdown).await;
            gw.disconnect();
            match outcome {
                Ok(SessionOutcome::Disconnected) => warn!(attempt, state = %session.state(), "disconnected"),
                Ok(done) => return Ok(done),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, state = %session.state(), "fatal session error");
                    return Err(e);
                }
                Err(e) => warn!(attempt, error = %e, "session error"),
            }
        } else {
            warn!(attempt, "connect failed");
        }

        if attempt == plan.attempts {
            error!(attempts = attempt, "giving up after reaching connection attempt cap");
            break;
        }
        if !wait_or_shutdown(plan.delay, shutdown).await {
            info!(attempt, "shutdown requested while waiting to reconnect");
            return Ok(SessionOutcome::Shutdown);
        }
    }
    Ok(SessionOutcome::Disconnected)
}

/// Sleep for `delay`; `false` when shutdown was asked for first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let pause = sleep(delay);
    tokio::pin!(pause);
    loop {
        select! {
            _ = &mut pause => return true,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return false,
                Ok(()) => {}
                Err(_) => {
                    pause.as_mut().await;
                    return true;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalog;
    use crate::domain::{SessionState, Symbol};
    use crate::gateway::testing::RecordingGateway;
    use crate::paper::{PaperConfig, PaperGateway};
    use crate::session::SessionSettings;
    use crate::strategy::Hold;

    fn settings(account: Option<&str>) -> SessionSettings {
        SessionSettings {
            max_loss: 1e12,
            account: account.map(str::to_string),
            subscription_cooldown: Duration::from_secs(16),
            log_callbacks: false,
        }
    }

    fn plan(attempts: u32) -> ReconnectPlan {
        ReconnectPlan {
            host: "127.0.0.1".into(),
            port: 4002,
            client_id: 1,
            connect_options: None,
            attempts,
            delay: Duration::from_secs(50),
            poll_timeout: Duration::from_millis(2000),
        }
    }

    fn refusing() -> RecordingGateway {
        RecordingGateway { refuse_connect: true, ..Default::default() }
    }

    fn paper() -> (PaperGateway, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = PaperConfig { account: "DU1".into(), ..Default::default() };
        let mut gw = PaperGateway::new(tx, cfg);
        assert!(gw.connect("127.0.0.1", 4002, 1));
        (gw, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn reconciles_against_paper_venue_until_shutdown() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let mut session = Session::new(&cat, settings(Some("DU1")), Box::new(Hold));
        let (mut gw, mut rx) = paper();
        let book = gw.book();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_secs(40)).await;
            let _ = stop_tx.send(true);
        });

        // paper venue starts with an unwanted long
        book.lock().apply_fill(&Symbol::new("MESH0"), crate::domain::Side::Buy, 2, 100.0);

        let outcome = run(&mut session, &mut gw, &mut rx, Duration::from_millis(2000), &mut stop_rx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Shutdown);
        assert!(matches!(session.state(), SessionState::CheckPositions | SessionState::CheckPnl));
        assert_eq!(session.ledger().actual(&Symbol::new("MESH0")).unwrap(), 0);
        assert_eq!(book.lock().position(&Symbol::new("MESH0")).qty, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_account_surfaces_as_fatal() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let mut session = Session::new(&cat, settings(None), Box::new(Hold));
        let (mut gw, mut rx) = paper();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let err = run(&mut session, &mut gw, &mut rx, Duration::from_millis(2000), &mut stop_rx)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::RequestPnl);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_ends_the_pump() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let mut session = Session::new(&cat, settings(Some("DU1")), Box::new(Hold));
        let (mut gw, mut rx) = paper();
        gw.disconnect();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let outcome = run(&mut session, &mut gw, &mut rx, Duration::from_millis(2000), &mut stop_rx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_noticed_before_polling() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let mut session = Session::new(&cat, settings(Some("DU1")), Box::new(Hold));
        let mut gw = RecordingGateway::default();
        session.handle_event(&mut gw, GatewayEvent::Ready { next_order_id: 100 }).unwrap();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let outcome = run(&mut session, &mut gw, &mut rx, Duration::from_millis(2000), &mut stop_rx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert!(gw.calls.is_empty());
        assert_eq!(session.state(), SessionState::RequestTradeData);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_shutdown_sender_keeps_the_pump_running() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let mut session = Session::new(&cat, settings(Some("DU1")), Box::new(Hold));
        let mut gw = RecordingGateway::connected();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        drop(stop_tx);

        // the gateway closing its channel is the only way out
        tx.send(GatewayEvent::Ready { next_order_id: 100 }).unwrap();
        drop(tx);

        let outcome = run(&mut session, &mut gw, &mut rx, Duration::from_millis(2000), &mut stop_rx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!(session.state(), SessionState::RequestOrderData);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_at_the_attempt_cap() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let (mut gateways, mut sessions) = (0, 0);
        let started = Instant::now();

        let outcome = run_with_reconnect(
            &plan(3),
            |_events: mpsc::UnboundedSender<GatewayEvent>| {
                gateways += 1;
                refusing()
            },
            || {
                sessions += 1;
                Session::new(&cat, settings(Some("DU1")), Box::new(Hold))
            },
            &mut stop_rx,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!((gateways, sessions), (3, 0));
        // two waits between three attempts
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(100) && waited < Duration::from_secs(101), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_after_disconnect_and_stops_on_fatal() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let mut live_senders = Vec::new();
        let mut gateways = 0;

        let err = run_with_reconnect(
            &plan(5),
            |events: mpsc::UnboundedSender<GatewayEvent>| {
                gateways += 1;
                // first connection dies at once; the second one says Ready
                if gateways > 1 {
                    events.send(GatewayEvent::Ready { next_order_id: 100 }).unwrap();
                    live_senders.push(events);
                }
                RecordingGateway::default()
            },
            || {
                let no_account = SessionSettings { subscription_cooldown: Duration::ZERO, ..settings(None) };
                Session::new(&cat, no_account, Box::new(Hold))
            },
            &mut stop_rx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::MissingAccount));
        assert_eq!(gateways, 2);
        assert_eq!(live_senders.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ctrl_c_during_backoff_stops_reconnecting() {
        let cat = test_catalog("MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD\n");
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_secs(60)).await;
            let _ = stop_tx.send(true);
        });
        let mut gateways = 0;
        let started = Instant::now();

        let outcome = run_with_reconnect(
            &plan(5),
            |_events: mpsc::UnboundedSender<GatewayEvent>| {
                gateways += 1;
                refusing()
            },
            || Session::new(&cat, settings(Some("DU1")), Box::new(Hold)),
            &mut stop_rx,
        )
        .await
        .unwrap();

        assert_eq!(outcome, SessionOutcome::Shutdown);
        assert_eq!(gateways, 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61), "{waited:?}");
    }
}
