//! Default input device capture through `cpal`.
//!
//! `cpal` streams are not `Send`, so each capture runs on its own thread that
//! owns the stream until the session is finished or dropped.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::device::{CaptureSession, DeviceFuture, Microphone, RecordedAudio, encode_wav};
use crate::sync::core::errors::DeviceError;

/// Microphone backed by the host's default input device.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpalMicrophone;

impl Microphone for CpalMicrophone {
    fn acquire(&self) -> DeviceFuture<'_, Result<Box<dyn CaptureSession>, DeviceError>> {
        Box::pin(async move {
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let (done_tx, done_rx) = oneshot::channel();

            thread::Builder::new()
                .name("parley-mic".to_string())
                .spawn(move || record(ready_tx, &stop_rx, done_tx))
                .map_err(|err| DeviceError::Unavailable(err.to_string()))?;

            ready_rx
                .await
                .map_err(|_| DeviceError::Capture("capture thread exited".to_string()))??;

            let session: Box<dyn CaptureSession> = Box::new(CpalCapture {
                stop: stop_tx,
                done: done_rx,
            });
            Ok(session)
        })
    }
}

struct CpalCapture {
    stop: mpsc::Sender<()>,
    done: oneshot::Receiver<Vec<u8>>,
}

impl CaptureSession for CpalCapture {
    fn finish(self: Box<Self>) -> DeviceFuture<'static, Result<RecordedAudio, DeviceError>> {
        let Self { stop, done } = *self;
        // A closed channel means the thread already stopped.
        let _ = stop.send(());
        Box::pin(async move {
            done.await
                .map(RecordedAudio::wav)
                .map_err(|_| DeviceError::Capture("recording was lost".to_string()))
        })
    }
}

type Ready = oneshot::Sender<Result<(), DeviceError>>;

fn record(ready: Ready, stop: &mpsc::Receiver<()>, done: oneshot::Sender<Vec<u8>>) {
    let samples = Arc::new(Mutex::new(Vec::<i16>::new()));
    let (stream, sample_rate, channels) = match open_stream(Arc::clone(&samples)) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    debug!(sample_rate, channels, "Microphone stream running");

    // Returns on stop or when the session is dropped.
    let _ = stop.recv();
    drop(stream);

    let recorded = samples
        .lock()
        .map(|mut buf| std::mem::take(&mut *buf))
        .unwrap_or_default();
    let _ = done.send(encode_wav(&recorded, sample_rate, channels));
}

fn open_stream(
    samples: Arc<Mutex<Vec<i16>>>,
) -> Result<(cpal::Stream, u32, u16), DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceError::Unavailable("no default input device".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|err| DeviceError::Unavailable(err.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let on_error = |err: cpal::StreamError| warn!(%err, "Microphone stream error");

    let stream = match format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = samples.lock() {
                    buf.extend_from_slice(data);
                }
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = samples.lock() {
                    buf.extend(data.iter().map(|s| f32_to_i16(*s)));
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported sample format {other:?}"
            )));
        }
    }
    .map_err(|err| match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::Unavailable("input device disappeared".to_string())
        }
        other => DeviceError::Unavailable(other.to_string()),
    })?;

    stream
        .play()
        .map_err(|err| DeviceError::Capture(err.to_string()))?;
    Ok((stream, sample_rate, channels))
}

#[allow(clippy::cast_possible_truncation)]
fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}
