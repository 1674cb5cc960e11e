//! Streaming gateway: one WebSocket per observer of one research task.
//!
//! Outbound events from the progress bus and inbound commands from the client
//! run independently. The bus subscription lives in the writer task, so the
//! observer is unregistered exactly once, when that task ends or is aborted.

use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use db::models::research_task::ResearchTask;
use deployment::Deployment;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use services::services::{
    dispatcher::{DispatchError, ResearchDispatcher},
    research_events::ResearchEvent,
};
use tokio::sync::mpsc;
use ts_rs::TS;
use uuid::Uuid;

use crate::DeploymentImpl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, TS)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Cancel,
    Pause,
    Resume,
}

impl ClientCommand {
    pub fn name(self) -> &'static str {
        match self {
            ClientCommand::Cancel => "cancel",
            ClientCommand::Pause => "pause",
            ClientCommand::Resume => "resume",
        }
    }

    async fn apply(
        self,
        dispatcher: &ResearchDispatcher,
        task_id: Uuid,
    ) -> Result<(), DispatchError> {
        match self {
            ClientCommand::Cancel => dispatcher.cancel(task_id).await.map(|_| ()),
            ClientCommand::Pause => dispatcher.pause(task_id).await.map(|_| ()),
            ClientCommand::Resume => dispatcher.resume(task_id).await.map(|_| ()),
        }
    }
}

pub async fn research_ws(
    ws: WebSocketUpgrade,
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_research_ws(socket, deployment, task_id).await {
            tracing::warn!("research WS for task {} closed: {}", task_id, e);
        }
    })
}

async fn handle_research_ws(
    socket: WebSocket,
    deployment: DeploymentImpl,
    task_id: Uuid,
) -> anyhow::Result<()> {
    let (mut sender, mut receiver) = socket.split();
    let pool = &deployment.db().pool;

    if ResearchTask::find_by_id(pool, task_id).await?.is_none() {
        return reject_unknown_task(&mut sender, task_id).await;
    }

    // Subscribe before taking the snapshot so nothing broadcast after it is lost.
    let mut subscription = deployment.progress_bus().register(task_id);
    let Some(task) = ResearchTask::find_by_id(pool, task_id).await? else {
        return reject_unknown_task(&mut sender, task_id).await;
    };

    send_event(&mut sender, &ResearchEvent::connected(&task)).await?;

    if let Some(terminal) = ResearchEvent::terminal_for(&task) {
        drop(subscription);
        send_event(&mut sender, &terminal).await?;
        let _ = sender.send(Message::Close(None)).await;
        return Ok(());
    }

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ResearchEvent>();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(
                            "Observer {} of task {} was dropped by the bus",
                            subscription.observer_id(),
                            subscription.task_id()
                        );
                        break;
                    }
                },
                Some(reply) = reply_rx.recv() => Arc::new(reply),
            };

            if send_event(&mut sender, &event).await.is_err() {
                return;
            }
            if event.is_terminal() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let dispatcher = deployment.dispatcher().clone();
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("research WS receive error for task {}: {}", task_id, e);
                        break;
                    }
                };

                let command = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::debug!("Unrecognised command on task {}: {}", task_id, e);
                        let _ = reply_tx.send(ResearchEvent::CommandRejected {
                            task_id,
                            command: command_name(text.as_str()),
                            error: e.to_string(),
                        });
                        continue;
                    }
                };

                if let Err(e) = command.apply(&dispatcher, task_id).await {
                    tracing::warn!(
                        "Rejected {} command for task {}: {}",
                        command.name(),
                        task_id,
                        e
                    );
                    let _ = reply_tx.send(ResearchEvent::CommandRejected {
                        task_id,
                        command: command.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    send_task.abort();
    Ok(())
}

async fn reject_unknown_task(
    sender: &mut SplitSink<WebSocket, Message>,
    task_id: Uuid,
) -> anyhow::Result<()> {
    let event = ResearchEvent::Error {
        task_id,
        error: "Research task not found".to_string(),
    };
    send_event(sender, &event).await?;
    let _ = sender.send(Message::Close(None)).await;
    Ok(())
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ResearchEvent,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}

fn command_name(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("command")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
