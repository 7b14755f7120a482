use std::sync::mpsc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

pub const MAX_INPUT_SIZE: usize = 256 * 1024;

const TIMEOUT: Duration = Duration::from_secs(1);

/// Runs inputs on a dedicated worker so a hang is reported as a timeout instead of stalling
/// the fuzzer.
pub struct Runner {
    name: &'static str,
    input_tx: mpsc::SyncSender<Vec<u8>>,
    output_rx: Mutex<mpsc::Receiver<()>>,
}

impl Runner {
    pub fn spawn(name: &'static str, work: fn(&[u8])) -> Self {
        let (input_tx, input_rx) = mpsc::sync_channel::<Vec<u8>>(0);
        let (output_tx, output_rx) = mpsc::sync_channel::<()>(0);

        std::thread::spawn(move || {
            for input in input_rx {
                work(&input);
                let _ = output_tx.send(());
            }
        });

        Runner {
            name,
            input_tx,
            output_rx: Mutex::new(output_rx),
        }
    }

    pub fn run(&self, data: &[u8]) {
        let cap = data.len().min(MAX_INPUT_SIZE);
        self.input_tx
            .send(data[..cap].to_vec())
            .unwrap_or_else(|_| panic!("{} worker thread exited", self.name));

        match self
            .output_rx
            .lock()
            .unwrap_or_else(|_| panic!("{} worker receiver poisoned", self.name))
            .recv_timeout(TIMEOUT)
        {
            Ok(()) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => panic!("{} fuzz target timed out", self.name),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                panic!("{} worker thread panicked", self.name)
            }
        }
    }
}
