//! Serving one connection.
//!
//! The calling thread decodes requests. Tversion and Tflush are answered
//! inline; everything else runs on its own thread so a slow backend call
//! never holds up decoding. Replies go out one at a time under the writer
//! lock, in whatever order they complete.
//!
//! Attach, auth and walk bind their fid only when the reply is written. A
//! request flushed or reset before then leaves the fid table untouched and
//! its backend state is clunked.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::{FidTable, Filesystem, Request, ServerConfig};
use crate::context::{CancelHandle, Context};
use crate::error::{Error, FsError, FsResult, Result};
use crate::message::{
    Body, Message, Rattach, Rauth, Rclunk, Rcreate, Rerror, Rflush, Ropen, Rread, Rremove, Rstat,
    Rversion, Rwalk, Rwrite, Rwstat, Tflush, Tversion,
};
use crate::protocol::{IOHDRSZ, NO_FID, NO_TAG, VERSION_9P2000, VERSION_UNKNOWN};
use crate::transport::{Listener, Sink, Transport};
use crate::wire::Discard;

/// Serves a [`Filesystem`] to any number of connections.
///
/// Each session works on its own clone of the filesystem, and that clone
/// is told to [`Filesystem::close`] when the session ends.
#[derive(Clone)]
pub struct Server<F: Filesystem> {
    fs: F,
    config: ServerConfig,
}

impl<F: Filesystem> Server<F> {
    pub fn new(fs: F, config: ServerConfig) -> Self {
        Self { fs, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run one session on `transport` until the client disconnects or
    /// the stream fails. Returns the error that ended the session, if any.
    pub fn serve<T: Transport>(&self, transport: T) -> Result<()> {
        let (reader, writer) = transport.split()?;
        let session = Arc::new(Session {
            fs: self.fs.clone(),
            config: self.config.clone(),
            fids: FidTable::new(),
            writer: Mutex::new(Box::new(writer)),
            inflight: Mutex::new(HashMap::new()),
            msize: AtomicU32::new(self.config.initial_msize),
            next_id: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        });
        log::debug!("session started");
        let res = session.run(reader);
        session.shutdown();
        match &res {
            Ok(()) => log::debug!("session ended"),
            Err(err) => log::error!("session failed: {}", err),
        }
        res
    }

    /// Accept connections forever, one thread per session.
    pub fn listen(&self, listener: &Listener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept()?;
            log::info!("accepted connection from {}", peer);
            let server = self.clone();
            thread::Builder::new()
                .name(format!("9p-session-{}", peer))
                .spawn(move || {
                    if let Err(err) = server.serve(stream) {
                        log::warn!("connection from {} closed: {}", peer, err);
                    }
                })?;
        }
    }
}

struct InFlight {
    id: u64,
    cancel: CancelHandle,
    flushed: Arc<AtomicBool>,
}

impl InFlight {
    fn abandon(&self) {
        self.flushed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// A fid binding held back until its reply goes out.
enum Bind<T> {
    Insert(u32, T),
    Replace(u32, T),
}

impl<T> Bind<T> {
    fn into_state(self) -> T {
        match self {
            Bind::Insert(_, state) | Bind::Replace(_, state) => state,
        }
    }
}

/// A reply and the binding that goes with it.
type Outcome<T> = (Body, Option<Bind<T>>);

struct Session<F: Filesystem> {
    fs: F,
    config: ServerConfig,
    fids: FidTable<F::Fid>,
    writer: Mutex<Box<dyn Sink>>,
    inflight: Mutex<HashMap<u16, InFlight>>,
    msize: AtomicU32,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: Filesystem> Session<F> {
    fn run<R: Discard>(self: &Arc<Self>, mut reader: R) -> Result<()> {
        loop {
            let msize = self.msize.load(Ordering::Acquire);
            let msg = match Message::read_from(&mut reader, msize) {
                Ok(msg) => msg,
                Err(Error::Hangup) => return Ok(()),
                Err(err) => return Err(err),
            };
            let ty = msg.message_type();
            if !ty.is_request() {
                return Err(Error::UnknownType(ty as u8));
            }
            log::trace!("<- tag {} {:?}", msg.tag, msg.body);

            match msg.body {
                Body::Tversion(req) => self.version(msg.tag, req)?,
                Body::Tflush(req) => self.flush(msg.tag, req)?,
                body => self.dispatch(msg.tag, body)?,
            }
        }
    }

    /// Negotiate msize and version, abandoning all earlier protocol state.
    fn version(&self, tag: u16, req: Tversion) -> Result<()> {
        self.reset();
        let msize = req.msize.min(self.config.max_msize);
        let version = if req.version.starts_with(VERSION_9P2000) {
            self.msize.store(msize, Ordering::Release);
            VERSION_9P2000
        } else {
            log::warn!("unsupported version {:?}", req.version);
            VERSION_UNKNOWN
        };
        log::debug!("version {} msize {}", version, msize);
        let reply = Rversion {
            msize,
            version: version.to_string(),
        };
        self.send(tag, reply.into())
    }

    /// Cancel the request on `oldtag` and acknowledge at once.
    ///
    /// The flushed request's reply is dropped unless it is already written,
    /// so it can never follow the Rflush.
    fn flush(&self, tag: u16, req: Tflush) -> Result<()> {
        let entry = self.inflight.lock().remove(&req.oldtag);
        match entry {
            Some(entry) => {
                entry.abandon();
                log::debug!("flushed tag {}", req.oldtag);
            }
            None => log::debug!("flush of idle tag {}", req.oldtag),
        }
        self.send(tag, Rflush {}.into())
    }

    fn dispatch(self: &Arc<Self>, tag: u16, body: Body) -> Result<()> {
        let (ctx, cancel) = Context::cancellable();
        let flushed = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(&tag) {
                drop(inflight);
                log::warn!("tag {} reused while in flight", tag);
                let reply = Rerror {
                    ename: FsError::DuplicateTag.to_string(),
                };
                return self.send(tag, reply.into());
            }
            inflight.insert(
                tag,
                InFlight {
                    id,
                    cancel,
                    flushed: flushed.clone(),
                },
            );
        }

        let session = self.clone();
        let req = Request { tag, ctx };
        let handle = thread::Builder::new()
            .name(format!("9p-tag-{}", tag))
            .spawn(move || session.handle(req, id, flushed, body))?;

        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
        Ok(())
    }

    fn handle(&self, req: Request, id: u64, flushed: Arc<AtomicBool>, body: Body) {
        let ty = body.message_type();
        let (reply, bind) = match self.call(&req, body) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::debug!("{} tag {}: {}", ty, req.tag, err);
                (
                    Rerror {
                        ename: err.to_string(),
                    }
                    .into(),
                    None,
                )
            }
        };
        if let Err(err) = self.finish(req.tag, id, &flushed, reply, bind) {
            log::error!("reply to tag {}: {}", req.tag, err);
            if let Err(err) = self.writer.lock().close() {
                log::debug!("close after failed reply: {}", err);
            }
        }
    }

    /// Write a reply that is not tied to a dispatched request.
    fn send(&self, tag: u16, body: Body) -> Result<()> {
        let msg = self.frame(tag, body);
        self.write(&mut self.writer.lock(), &msg)
    }

    /// Retire a dispatched request and write its reply.
    ///
    /// The flushed check, the fid binding and the write all happen under
    /// the writer lock, so a concurrent Tflush or Tversion either sees the
    /// request fully answered or finds nothing of it left behind.
    fn finish(
        &self,
        tag: u16,
        id: u64,
        flushed: &AtomicBool,
        body: Body,
        bind: Option<Bind<F::Fid>>,
    ) -> Result<()> {
        let mut writer = self.writer.lock();
        {
            let mut table = self.inflight.lock();
            if table.get(&tag).is_some_and(|e| e.id == id) {
                table.remove(&tag);
            }
        }
        if flushed.load(Ordering::SeqCst) {
            drop(writer);
            log::debug!("dropping reply to flushed tag {}", tag);
            if let Some(bind) = bind {
                self.release(&bind.into_state());
            }
            return Ok(());
        }
        let mut msg = self.frame(tag, body);
        if let Some(bind) = bind {
            if matches!(msg.body, Body::Rerror(_)) {
                // The reply did not fit and went out as an error.
                self.release(&bind.into_state());
            } else if let Err(err) = self.bind(bind) {
                let reply = Rerror {
                    ename: err.to_string(),
                };
                msg = self.frame(tag, reply.into());
            }
        }
        self.write(&mut writer, &msg)
    }

    /// Wrap a reply, swapping in an Rerror if it would exceed msize.
    fn frame(&self, tag: u16, body: Body) -> Message {
        let msize = self.msize.load(Ordering::Acquire);
        let msg = Message::new(tag, body);
        if msg.size() > msize as u64 {
            log::warn!(
                "{} reply of {} bytes exceeds msize {}",
                msg.message_type(),
                msg.size(),
                msize
            );
            return Message::new(
                tag,
                Rerror {
                    ename: format!("reply exceeds msize {}", msize),
                },
            );
        }
        msg
    }

    fn write(&self, writer: &mut Box<dyn Sink>, msg: &Message) -> Result<()> {
        log::trace!("-> tag {} {:?}", msg.tag, msg.body);
        msg.write_to(&mut **writer, self.msize.load(Ordering::Acquire))
    }

    /// Commit a binding. Runs under the writer lock, which every binding
    /// takes, so the checks cannot race another bind.
    fn bind(&self, bind: Bind<F::Fid>) -> FsResult<()> {
        match bind {
            Bind::Insert(fid, state) if !self.fids.contains(fid) => {
                self.fids.insert(fid, state)?;
            }
            Bind::Replace(fid, state) if self.fids.contains(fid) => {
                self.fids.replace(fid, state)?;
            }
            Bind::Insert(_, state) => {
                self.release(&state);
                return Err(FsError::DuplicateFid);
            }
            Bind::Replace(_, state) => {
                self.release(&state);
                return Err(FsError::UnknownFid);
            }
        }
        Ok(())
    }

    /// Hand fid state that never reached the table back to the backend.
    fn release(&self, state: &F::Fid) {
        let req = Request {
            tag: NO_TAG,
            ctx: Context::background(),
        };
        if let Err(err) = self.fs.clunk(&req, state) {
            log::warn!("releasing fid: {}", err);
        }
    }

    fn call(&self, req: &Request, body: Body) -> FsResult<Outcome<F::Fid>> {
        match body {
            Body::Tauth(t) => {
                if self.fids.contains(t.afid) {
                    return Err(FsError::DuplicateFid);
                }
                let (aqid, state) = self.fs.auth(req, &t.uname, &t.aname)?;
                Ok((Rauth { aqid }.into(), Some(Bind::Insert(t.afid, state))))
            }
            Body::Tattach(t) => {
                if self.fids.contains(t.fid) {
                    return Err(FsError::DuplicateFid);
                }
                let afid = match t.afid {
                    NO_FID => None,
                    afid => Some(self.fids.get(afid)?),
                };
                let (qid, state) = self.fs.attach(req, afid.as_deref(), &t.uname, &t.aname)?;
                Ok((Rattach { qid }.into(), Some(Bind::Insert(t.fid, state))))
            }
            Body::Twalk(t) => {
                let fid = self.fids.get(t.fid)?;
                if t.newfid != t.fid && self.fids.contains(t.newfid) {
                    return Err(FsError::DuplicateFid);
                }
                let (wqids, state) = self.fs.walk(req, &fid, &t.wnames)?;
                let bind = match state {
                    Some(state) if wqids.len() == t.wnames.len() => Some(if t.newfid == t.fid {
                        Bind::Replace(t.fid, state)
                    } else {
                        Bind::Insert(t.newfid, state)
                    }),
                    Some(state) => {
                        self.release(&state);
                        None
                    }
                    None => None,
                };
                Ok((Rwalk { wqids }.into(), bind))
            }
            Body::Topen(t) => {
                let fid = self.fids.get(t.fid)?;
                let (qid, iounit) = self.fs.open(req, &fid, t.mode)?;
                let reply = Ropen {
                    qid,
                    iounit: self.iounit(iounit),
                };
                Ok((reply.into(), None))
            }
            Body::Tcreate(t) => {
                let fid = self.fids.get(t.fid)?;
                let (qid, iounit) = self.fs.create(req, &fid, &t.name, t.perm, t.mode)?;
                let reply = Rcreate {
                    qid,
                    iounit: self.iounit(iounit),
                };
                Ok((reply.into(), None))
            }
            Body::Tread(t) => {
                let fid = self.fids.get(t.fid)?;
                let limit = self.msize.load(Ordering::Acquire).saturating_sub(IOHDRSZ);
                let count = t.count.min(limit);
                let mut data = self.fs.read(req, &fid, t.offset, count)?;
                data.truncate(count as usize);
                Ok((Rread { data: data.into() }.into(), None))
            }
            Body::Twrite(t) => {
                let fid = self.fids.get(t.fid)?;
                let count = self.fs.write(req, &fid, t.offset, &t.data)?;
                Ok((Rwrite { count }.into(), None))
            }
            Body::Tclunk(t) => {
                let fid = self.fids.remove(t.fid)?;
                self.fs.clunk(req, &fid)?;
                Ok((Rclunk {}.into(), None))
            }
            Body::Tremove(t) => {
                let fid = self.fids.remove(t.fid)?;
                self.fs.remove(req, &fid)?;
                Ok((Rremove {}.into(), None))
            }
            Body::Tstat(t) => {
                let fid = self.fids.get(t.fid)?;
                let stat = self.fs.stat(req, &fid)?;
                Ok((Rstat { stat }.into(), None))
            }
            Body::Twstat(t) => {
                let fid = self.fids.get(t.fid)?;
                self.fs.wstat(req, &fid, &t.stat)?;
                Ok((Rwstat {}.into(), None))
            }
            other => Err(FsError::Other(format!("unexpected {}", other.message_type()))),
        }
    }

    fn iounit(&self, backend: u32) -> u32 {
        if backend == 0 {
            self.config.iounit
        } else {
            backend
        }
    }

    /// Abandon in-flight requests and drop every fid.
    ///
    /// Holding the writer lock keeps requests from binding fids between
    /// the abandon and the drain.
    fn reset(&self) {
        let (abandoned, fids) = {
            let _writer = self.writer.lock();
            let abandoned: Vec<_> = self.inflight.lock().drain().map(|(_, e)| e).collect();
            for entry in &abandoned {
                entry.abandon();
            }
            (abandoned, self.fids.drain())
        };
        if !abandoned.is_empty() || !fids.is_empty() {
            log::debug!(
                "reset: abandoned {} requests, dropped {} fids",
                abandoned.len(),
                fids.len()
            );
        }
        for fid in fids {
            self.release(&fid);
        }
    }

    fn shutdown(&self) {
        self.reset();
        if let Err(err) = self.writer.lock().close() {
            log::debug!("close: {}", err);
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("request thread panicked");
            }
        }
        if let Err(err) = self.fs.close() {
            log::warn!("filesystem close: {}", err);
        }
    }
}
