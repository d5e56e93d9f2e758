//! In-memory transport for exercising the session state machine without a
//! broker. Behaviour is scripted through a shared [`Script`].

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::{sync::Notify, time::Instant};

use crate::{
    transport::{SenderLink, Transport, TransportError},
    OutboundMessage,
};

#[derive(Debug, Default)]
pub(crate) struct Script {
    /// Connect attempts that fail before one succeeds
    pub connect_failures: usize,
    /// Connect never completes
    pub hang_connect: bool,
    pub refuse_link: bool,
    /// Sends accepted per link before the link reports loss
    pub sends_before_loss: Option<usize>,

    pub connect_attempts: Vec<Instant>,
    pub links_opened: usize,
    pub sent: Vec<OutboundMessage>,
    pub links_closed: usize,
    pub links_lost_idle: usize,
    pub transports_closed: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    link_loss: Arc<Notify>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            link_loss: Arc::new(Notify::new()),
        }
    }

    /// Make the current (or next) open link report loss while idle
    pub fn drop_link(&self) {
        self.link_loss.notify_one();
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("script lock poisoned")
    }
}

pub(crate) struct ScriptedLink {
    script: Arc<Mutex<Script>>,
    link_loss: Arc<Notify>,
    remaining: Option<usize>,
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    type Link = ScriptedLink;

    async fn connect(&mut self) -> Result<(), TransportError> {
        let hang = {
            let mut script = self.script();
            script.connect_attempts.push(Instant::now());
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(TransportError::Connect("connection refused".into()));
            }
            script.hang_connect
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn open_sender(&mut self, _address: &str) -> Result<ScriptedLink, TransportError> {
        let mut script = self.script();
        if script.refuse_link {
            return Err(TransportError::Attach("link refused".into()));
        }
        script.links_opened += 1;
        Ok(ScriptedLink {
            script: self.script.clone(),
            link_loss: self.link_loss.clone(),
            remaining: script.sends_before_loss,
        })
    }

    async fn close(&mut self) {
        self.script().transports_closed += 1;
    }
}

#[async_trait::async_trait]
impl SenderLink for ScriptedLink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        match self.remaining.as_mut() {
            Some(0) => return Err(TransportError::Closed),
            Some(remaining) => *remaining -= 1,
            None => {}
        }
        self.script
            .lock()
            .expect("script lock poisoned")
            .sent
            .push(message);
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        self.link_loss.notified().await;
        self.script
            .lock()
            .expect("script lock poisoned")
            .links_lost_idle += 1;
        TransportError::Detached("peer detached".into())
    }

    async fn close(&mut self) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .links_closed += 1;
    }
}
