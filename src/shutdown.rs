use tokio::sync::broadcast;

/// Process-wide stop signal.
///
/// Every clone holds its own subscription, so each task that owns one sees
/// the signal independently. Once observed, `recv` returns immediately on
/// every later call.
#[derive(Debug)]
pub struct Shutdown {
    shutdown: bool,
    receiver: broadcast::Receiver<()>,
    sender: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (sender, receiver) = broadcast::channel(1);
        Shutdown {
            shutdown: false,
            receiver,
            sender,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Wait for the signal.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        // Lagged or closed both mean the signal went out.
        let _ = self.receiver.recv().await;
        self.shutdown = true;
    }

    /// Send the signal to every clone.
    pub fn trigger(&mut self) {
        self.shutdown = true;
        let _ = self.sender.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Shutdown {
        Shutdown {
            shutdown: self.shutdown,
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }
}
