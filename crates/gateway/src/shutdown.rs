use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    /// First CTRL+C: finish in-flight work, then exit.
    Graceful,
    /// Second CTRL+C: exit immediately.
    Immediate,
}

pub fn spawn_ctrl_c_handler(tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut presses = 0u8;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            presses += 1;
            let event = if presses == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if tx.send(event).is_err() || presses > 1 {
                return;
            }
        }
    });
}
