//! N→1 multiplexer for the consumer's process/reclaim ack channels (C3).
//!
//! Spawns one forwarding task per input receiver; all forward into a single
//! shared sender. The output channel closes once every forwarding task's
//! sender clone has been dropped — the last one out closes the door, same
//! idiom as a single-timer background task, generalized to N sources.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Merges `inputs` into one output channel. Cancelling `cancel` stops
/// forwarding on all branches and the output closes shortly after.
pub fn fan_in<T: Send + 'static>(
    inputs: Vec<mpsc::Receiver<T>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(inputs.len().max(1) * 16);

    for mut input in inputs {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = input.recv() => {
                        match item {
                            Some(item) => {
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }
    // Drop our own sender so the channel closes once every spawned task's
    // clone is dropped, rather than staying open forever.
    drop(tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_from_all_inputs() {
        let (tx1, rx1) = mpsc::channel(8);
        let (tx2, rx2) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let mut out = fan_in(vec![rx1, rx2], cancel);

        tx1.send(1).await.unwrap();
        tx2.send(2).await.unwrap();
        drop(tx1);
        drop(tx2);

        let mut got = vec![out.recv().await.unwrap(), out.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_closes_output() {
        let (tx1, rx1) = mpsc::channel::<i32>(8);
        let cancel = CancellationToken::new();
        let mut out = fan_in(vec![rx1], cancel.clone());
        cancel.cancel();
        assert!(out.recv().await.is_none());
        drop(tx1);
    }
}
