//! Command execution against a sync context

use std::io::{self, Write};

use tracing::{info, warn};
use usmessage_core::{
    AttachmentId, Conversation, ConversationId, Device, DeviceId, Message, Snapshot,
    SnapshotSource, SyncContext, SyncEvent,
};

use crate::cli::Commands;
use crate::error::{CliError, Result};

/// Runs one subcommand and writes its report to `out`
pub struct CommandDispatcher<W: Write> {
    context: SyncContext,
    device: Option<DeviceId>,
    out: W,
}

impl CommandDispatcher<io::Stdout> {
    pub fn new(context: SyncContext, device: Option<DeviceId>) -> Self {
        Self::with_output(context, device, io::stdout())
    }
}

impl<W: Write> CommandDispatcher<W> {
    pub fn with_output(context: SyncContext, device: Option<DeviceId>, out: W) -> Self {
        Self {
            context,
            device,
            out,
        }
    }

    pub async fn execute(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Scan => self.scan().await,
            Commands::Connect => {
                let device = self.connect().await?;
                writeln!(self.out, "Connected to {} ({})", device.name, device.id)?;
                Ok(())
            }
            Commands::Status => {
                if self.device.is_some() {
                    self.connect().await?;
                }
                let status = serde_json::to_string_pretty(&self.context.status())?;
                writeln!(self.out, "{}", status)?;
                Ok(())
            }
            Commands::Conversations => {
                self.connect().await?;
                let snapshot = self.context.fetch_conversations().await;
                self.report_source(&snapshot)?;
                for conversation in &snapshot.items {
                    writeln!(self.out, "{}", format_conversation(conversation))?;
                }
                Ok(())
            }
            Commands::Messages { conversation } => {
                self.connect().await?;
                let snapshot = self
                    .context
                    .fetch_messages(&ConversationId::from(conversation))
                    .await;
                self.report_source(&snapshot)?;
                for message in &snapshot.items {
                    writeln!(self.out, "{}", format_message(message))?;
                }
                Ok(())
            }
            Commands::Send {
                conversation,
                text,
                attach,
            } => {
                self.connect().await?;
                let message = self
                    .context
                    .send_message(&ConversationId::from(conversation), &text, &attach)
                    .await?;
                writeln!(self.out, "{}", format_message(&message))?;
                Ok(())
            }
            Commands::Download { attachment } => {
                self.connect().await?;
                let path = self
                    .context
                    .download_attachment(&AttachmentId::from(attachment))
                    .await?;
                writeln!(self.out, "{}", path.display())?;
                Ok(())
            }
            Commands::Watch => self.watch().await,
        }
    }

    /// Disconnect and hand back the output sink
    pub async fn finish(self) -> Result<W> {
        self.context.shutdown().await?;
        Ok(self.out)
    }

    async fn scan(&mut self) -> Result<()> {
        let devices = self.context.scan().await?;
        if devices.is_empty() {
            writeln!(self.out, "No devices found")?;
        }
        for device in &devices {
            writeln!(self.out, "{}", format_device(device))?;
        }
        Ok(())
    }

    /// Connect to `--device`, or to the first candidate a scan turns up
    async fn connect(&mut self) -> Result<Device> {
        let device_id = match &self.device {
            Some(id) => id.clone(),
            None => {
                let candidates = self.context.scan().await?;
                let first = candidates.into_iter().next().ok_or(CliError::NoDevice)?;
                info!("Selected {} ({})", first.name, first.id);
                first.id
            }
        };
        Ok(self.context.connect(&device_id).await?)
    }

    async fn watch(&mut self) -> Result<()> {
        let mut events = self.context.subscribe_all();
        let device = self.connect().await?;
        writeln!(self.out, "Watching {}; press Ctrl+C to stop", device.name)?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(line) = format_event(&event) {
                            writeln!(self.out, "{}", line)?;
                            self.out.flush()?;
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    fn report_source<T>(&mut self, snapshot: &Snapshot<T>) -> Result<()> {
        match &snapshot.source {
            SnapshotSource::Device => {}
            SnapshotSource::Cache => writeln!(self.out, "(offline: showing cached data)")?,
            SnapshotSource::StaleCache { error } => {
                warn!("Device did not answer: {}", error);
                writeln!(self.out, "(stale: {})", error)?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

pub fn format_device(device: &Device) -> String {
    format!("{}\t{}\t{}", device.id, device.name, device.transport)
}

pub fn format_conversation(conversation: &Conversation) -> String {
    let unread = if conversation.unread_count > 0 {
        format!(" [{}]", conversation.unread_count)
    } else {
        String::new()
    };
    let preview = conversation
        .last_message
        .as_ref()
        .map(|message| message.preview())
        .unwrap_or_default();
    format!(
        "{}\t{}{}\t{}",
        conversation.id, conversation.display_name, unread, preview
    )
}

pub fn format_message(message: &Message) -> String {
    let sender = if message.is_from_me {
        "me"
    } else {
        message.sender.as_str()
    };
    let mut line = format!(
        "{}\t{}: {} ({:?})",
        message.id,
        sender,
        message.preview(),
        message.status
    );
    for attachment in &message.attachments {
        line.push_str(&format!("\n\t+ {} {}", attachment.id, attachment.filename));
    }
    line
}

/// One line per event worth showing; `None` for bookkeeping events
pub fn format_event(event: &SyncEvent) -> Option<String> {
    if let Some(notification) = event.notification() {
        return Some(format!("{}: {}", notification.title, notification.body));
    }
    match event {
        SyncEvent::StateChanged(state) => Some(format!("state: {}", state.name())),
        SyncEvent::MessageUpdated(message) => Some(format!(
            "{} is now {:?}",
            message.id, message.status
        )),
        _ => None,
    }
}
