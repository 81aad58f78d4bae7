use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::{self, Command, PublishArgs, HELP};
use crate::config::AppConfig;
use crate::mqtt::message_manager::{Direction, HistoryEntry};
use crate::mqtt::mqtt_handler::SessionState;
use crate::mqtt::session::{PublishRequest, SessionSnapshot};
use crate::runtime::SessionHandle;

/// Line-oriented front end over a running session worker
pub struct Console {
    session: SessionHandle,
    config: AppConfig,
}

impl Console {
    pub fn new(session: SessionHandle, config: AppConfig) -> Self {
        Console { session, config }
    }

    /// Registers the configured subscriptions so they go out on first connect.
    pub async fn register_subscriptions(&self) -> Result<()> {
        for subscription in &self.config.subscriptions {
            if !self
                .session
                .add_subscription(&subscription.topic, subscription.qos)
                .await?
            {
                warn!("Skipping subscription {}", subscription);
            }
        }
        Ok(())
    }

    /// Reads stdin until `quit` or end of input, then hands the session back.
    pub async fn run(self) -> Result<SessionHandle> {
        let printer = spawn_printer(self.session.watch(), self.session.history_stream());
        println!("Type `help` for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match command::parse(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => {
                    debug!("Console command: {:?}", command);
                    if let Err(e) = self.dispatch(command).await {
                        println!("error: {}", e);
                    }
                }
                Err(e) => println!("{}", e),
            }
        }

        info!("Leaving console");
        printer.abort();
        Ok(self.session)
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Connect { broker_url } => {
                let mut connection = self.config.connection.clone();
                if let Some(url) = broker_url {
                    connection.broker_url = url;
                }
                println!("Connecting to {} as {}", connection.broker_url, connection.client_id);
                let session = self.session.connect(connection).await?;
                debug!("Session {} opened", session);
            }
            Command::Disconnect => {
                if !self.session.disconnect().await? {
                    println!("Not connected");
                }
            }
            Command::Subscribe { topic, qos } => {
                if self.session.add_subscription(&topic, qos).await? {
                    println!("Subscribed to {} (qos {})", topic, qos);
                } else {
                    println!("Already subscribed to {}", topic);
                }
            }
            Command::Unsubscribe { topic } => {
                if !self.session.remove_subscription(&topic).await? {
                    println!("No subscription for {}", topic);
                }
            }
            Command::Publish(args) => {
                self.session.publish(self.publish_request(args)).await?;
            }
            Command::History => {
                let history = self.session.history().await?;
                if history.is_empty() {
                    println!("No messages");
                }
                for entry in &history {
                    println!("{}", entry);
                }
            }
            Command::Clear => self.session.clear_history().await?,
            Command::Status => print_status(&self.session.snapshot(), &self.config),
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    fn publish_request(&self, args: PublishArgs) -> PublishRequest {
        let defaults = &self.config.publish;
        PublishRequest::new(
            args.topic.unwrap_or_else(|| defaults.topic.clone()),
            args.message,
        )
        .with_mode(args.mode.unwrap_or(defaults.mode))
        .with_qos(args.qos.unwrap_or(defaults.qos))
        .with_retain(args.retain || defaults.retain)
    }
}

fn print_status(snapshot: &SessionSnapshot, config: &AppConfig) {
    println!("state:        {}", snapshot.state);
    // The live session may use a broker given to `connect`
    println!(
        "broker:       {}",
        snapshot
            .broker_url
            .as_deref()
            .unwrap_or(&config.connection.broker_url)
    );
    println!(
        "client id:    {}",
        snapshot
            .client_id
            .as_deref()
            .unwrap_or(&config.connection.client_id)
    );
    println!("history:      {} entries", snapshot.history_len);
    println!("received:     {}", snapshot.messages_received);
    println!("sent:         {}", snapshot.messages_sent);
    if let Some(at) = snapshot.last_activity {
        println!("last message: {}", at.format("%H:%M:%S"));
    }
    if snapshot.subscriptions.is_empty() {
        println!("subscriptions: none");
    } else {
        println!("subscriptions:");
        for subscription in &snapshot.subscriptions {
            println!("  {}", subscription);
        }
    }
}

/// Prints state changes and inbound messages as the worker reports them.
fn spawn_printer(
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut history: broadcast::Receiver<HistoryEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = snapshots.borrow_and_update().state.clone();

        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = snapshots.borrow_and_update().state.clone();
                    if current != state {
                        print_state(&current);
                        state = current;
                    }
                }
                entry = history.recv() => match entry {
                    Ok(entry) if entry.direction() == Direction::Inbound => println!("{}", entry),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        println!("* {} log entries skipped, see `history`", skipped)
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Session updates closed");
    })
}

fn print_state(state: &SessionState) {
    match state {
        SessionState::Error(message) => println!("* connection error: {}", message),
        SessionState::DisconnectedAfterError(message) => {
            println!("* disconnected after error: {}", message)
        }
        other => println!("* {}", other),
    }
}
