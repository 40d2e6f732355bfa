//! Async camera handle backed by a dedicated worker thread.
//!
//! The worker owns the [`Camera`] and serves one request at a time, in the
//! order they were sent. Replies come back over `oneshot` channels and frames
//! are copied out of the mapped buffers before they cross threads.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::camera::{Camera, CloseHandle};
use crate::config::CaptureConfig;
use crate::error::{CameraError, OpenFailure, Result};
use crate::traits::{
    ControlDescriptor, FormatDescriptor, FormatEntry, Fraction, OwnedFrame, VideoBackend,
};

/// Requests served by the camera worker.
#[derive(Debug)]
enum Request {
    ListFormats {
        respond_to: oneshot::Sender<Result<Vec<FormatEntry>>>,
    },
    Format {
        respond_to: oneshot::Sender<Result<FormatDescriptor>>,
    },
    SetFormat {
        width: u32,
        height: u32,
        respond_to: oneshot::Sender<Result<FormatDescriptor>>,
    },
    FrameInterval {
        respond_to: oneshot::Sender<Result<Fraction>>,
    },
    SetFrameInterval {
        interval: Fraction,
        respond_to: oneshot::Sender<Result<Fraction>>,
    },
    Controls {
        respond_to: oneshot::Sender<Result<Vec<ControlDescriptor>>>,
    },
    Control {
        id: u32,
        respond_to: oneshot::Sender<Result<i64>>,
    },
    SetControl {
        id: u32,
        value: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Start {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Capture {
        respond_to: oneshot::Sender<Result<OwnedFrame>>,
    },
    ToRgb {
        respond_to: oneshot::Sender<Result<Vec<u8>>>,
    },
    ToRgba {
        respond_to: oneshot::Sender<Result<Vec<u8>>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

fn reply<T>(respond_to: oneshot::Sender<T>, value: T) {
    if respond_to.send(value).is_err() {
        debug!("camera requester went away before the reply");
    }
}

fn serve<B: VideoBackend>(mut camera: Camera<B>, mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.blocking_recv() {
        match request {
            Request::ListFormats { respond_to } => reply(respond_to, camera.list_formats()),
            Request::Format { respond_to } => reply(respond_to, camera.format()),
            Request::SetFormat {
                width,
                height,
                respond_to,
            } => reply(respond_to, camera.set_format(width, height)),
            Request::FrameInterval { respond_to } => reply(respond_to, camera.frame_interval()),
            Request::SetFrameInterval {
                interval,
                respond_to,
            } => reply(respond_to, camera.set_frame_interval(interval)),
            Request::Controls { respond_to } => reply(respond_to, camera.controls()),
            Request::Control { id, respond_to } => reply(respond_to, camera.control(id)),
            Request::SetControl {
                id,
                value,
                respond_to,
            } => reply(respond_to, camera.set_control(id, value)),
            Request::Start { respond_to } => reply(respond_to, camera.start()),
            Request::Stop { respond_to } => reply(respond_to, camera.stop()),
            Request::Capture { respond_to } => {
                let frame = camera.capture_frame().map(|frame| frame.to_owned_frame());
                reply(respond_to, frame);
            }
            Request::ToRgb { respond_to } => reply(respond_to, camera.to_rgb()),
            Request::ToRgba { respond_to } => reply(respond_to, camera.to_rgba()),
            Request::Close { respond_to } => {
                camera.close();
                reply(respond_to, ());
                break;
            }
        }
    }
    camera.close();
    debug!(path = %camera.path().display(), "camera worker exiting");
}

/// Async handle to a camera served by its own thread.
#[derive(Debug)]
pub struct AsyncCamera {
    request_sender: mpsc::UnboundedSender<Request>,
    close_handle: CloseHandle,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AsyncCamera {
    /// Open a V4L2 device on a new worker thread.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let worker_path = path.clone();
        Self::spawn(path, move || Camera::open(worker_path)).await
    }

    /// Open and configure a V4L2 device on a new worker thread.
    pub async fn open_with(config: CaptureConfig) -> Result<Self> {
        let path = config.device.clone();
        Self::spawn(path, move || Camera::open_with(&config)).await
    }

    /// Run the camera built by `factory` on a new worker thread.
    pub async fn spawn<B, F>(path: PathBuf, factory: F) -> Result<Self>
    where
        B: VideoBackend + 'static,
        F: FnOnce() -> Result<Camera<B>> + Send + 'static,
    {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (opened_sender, opened) = oneshot::channel();

        let worker = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || match factory() {
                Ok(camera) => {
                    reply(opened_sender, Ok(camera.close_handle()));
                    serve(camera, request_receiver);
                }
                Err(err) => reply(opened_sender, Err(err)),
            })
            .map_err(|err| CameraError::DeviceOpenFailed {
                path: path.clone(),
                reason: OpenFailure::Io(err),
            })?;

        let close_handle = opened.await.map_err(|_| CameraError::Closed)??;
        debug!(path = %path.display(), "camera worker started");

        Ok(Self {
            request_sender,
            close_handle,
            worker: Mutex::new(Some(worker)),
        })
    }

    async fn request<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Request,
    {
        let (respond_to, response) = oneshot::channel();
        self.request_sender
            .send(make(respond_to))
            .map_err(|_| CameraError::Closed)?;
        response.await.map_err(|_| CameraError::Closed)?
    }

    /// Handle that closes the camera without waiting.
    pub fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    /// See [`Camera::list_formats`].
    pub async fn list_formats(&self) -> Result<Vec<FormatEntry>> {
        self.request(|respond_to| Request::ListFormats { respond_to }).await
    }

    /// See [`Camera::format`].
    pub async fn format(&self) -> Result<FormatDescriptor> {
        self.request(|respond_to| Request::Format { respond_to }).await
    }

    /// See [`Camera::set_format`].
    pub async fn set_format(&self, width: u32, height: u32) -> Result<FormatDescriptor> {
        self.request(|respond_to| Request::SetFormat {
            width,
            height,
            respond_to,
        })
        .await
    }

    /// See [`Camera::frame_interval`].
    pub async fn frame_interval(&self) -> Result<Fraction> {
        self.request(|respond_to| Request::FrameInterval { respond_to }).await
    }

    /// See [`Camera::set_frame_interval`].
    pub async fn set_frame_interval(&self, interval: Fraction) -> Result<Fraction> {
        self.request(|respond_to| Request::SetFrameInterval {
            interval,
            respond_to,
        })
        .await
    }

    /// See [`Camera::controls`].
    pub async fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        self.request(|respond_to| Request::Controls { respond_to }).await
    }

    /// See [`Camera::control`].
    pub async fn control(&self, id: u32) -> Result<i64> {
        self.request(|respond_to| Request::Control { id, respond_to }).await
    }

    /// See [`Camera::set_control`].
    pub async fn set_control(&self, id: u32, value: i64) -> Result<()> {
        self.request(|respond_to| Request::SetControl {
            id,
            value,
            respond_to,
        })
        .await
    }

    /// See [`Camera::start`].
    pub async fn start(&self) -> Result<()> {
        self.request(|respond_to| Request::Start { respond_to }).await
    }

    /// See [`Camera::stop`].
    pub async fn stop(&self) -> Result<()> {
        self.request(|respond_to| Request::Stop { respond_to }).await
    }

    /// Wait for the next frame and copy it out.
    pub async fn capture_frame(&self) -> Result<OwnedFrame> {
        self.request(|respond_to| Request::Capture { respond_to }).await
    }

    /// See [`Camera::to_rgb`].
    pub async fn to_rgb(&self) -> Result<Vec<u8>> {
        self.request(|respond_to| Request::ToRgb { respond_to }).await
    }

    /// See [`Camera::to_rgba`].
    pub async fn to_rgba(&self) -> Result<Vec<u8>> {
        self.request(|respond_to| Request::ToRgba { respond_to }).await
    }

    /// Close the camera and wait for the worker to exit.
    ///
    /// A capture in flight resolves with [`CameraError::Cancelled`].
    pub async fn close(&self) {
        self.close_handle.close();

        let (respond_to, done) = oneshot::channel();
        if self.request_sender.send(Request::Close { respond_to }).is_ok() && done.await.is_err() {
            debug!("camera worker exited before acknowledging close");
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("camera worker panicked"),
                Err(err) => warn!(error = %err, "failed to join camera worker"),
            }
        }
    }
}

impl Drop for AsyncCamera {
    fn drop(&mut self) {
        self.close_handle.close();
    }
}
