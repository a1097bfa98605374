//! The client multiplexer.
//!
//! One reader thread owns the receiving half of the stream. Each operation
//! acquires a tag, registers a handler for it, writes its request under the
//! writer lock and waits on a one-shot channel. The reader decodes each
//! reply header and hands the body to the handler registered for that tag.
//! A reply whose payload is shorter than its size field is fatal; a reply
//! for a tag nobody waits on is skipped whole.

use std::collections::HashMap;
use std::io::{Read, Take};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use super::ClientConfig;
use super::tags::TagPool;
use crate::context::{Context, Waited};
use crate::error::{Error, Result};
use crate::message::{
    Body, Data, Header, Message, Payload, Rattach, Rauth, Rclunk, Rcreate, Rflush, Ropen, Rread,
    Rremove, Rstat, Rversion, Rwalk, Rwrite, Rwstat, Tattach, Tauth, Tclunk, Tcreate, Tflush,
    Topen, Tread, Tremove, Tstat, Tversion, Twalk, Twrite, Twstat, decode_reply,
};
use crate::protocol::{IOHDRSZ, MIN_MSIZE, MessageType, NO_TAG};
use crate::qid::Qid;
use crate::stat::Stat;
use crate::transport::{Sink, Transport};
use crate::wire::Discard;

/// Decodes one reply body on the reader thread.
///
/// An error returned from a handler is fatal to the connection.
type Handler = Box<dyn FnOnce(Header, &mut ReplyBody<'_>) -> Result<()> + Send>;

/// One reply's bytes on the reader thread.
type ReplyBody<'a> = Take<&'a mut dyn Discard>;

#[derive(Default)]
struct Pending {
    handlers: HashMap<u16, Handler>,
    /// Set once the connection is dead; the text of what killed it.
    closed: Option<String>,
}

struct Shared {
    writer: Mutex<Box<dyn Sink>>,
    pending: Mutex<Pending>,
    tags: TagPool,
    /// Tags for Tflush, one per ordinary tag, so a flush never waits on
    /// the calls it is cleaning up after.
    flush_tags: TagPool,
    msize: AtomicU32,
}

impl Shared {
    fn closed_error(&self) -> Error {
        let cause = self.pending.lock().closed.clone();
        Error::ConnectionClosed(cause.unwrap_or_else(|| "connection closed".into()))
    }

    /// Tear the connection down and fail every waiting operation.
    ///
    /// Dropping a handler drops its reply sender, which wakes its waiter.
    fn fail_all(&self, cause: &Error) {
        let orphans = {
            let mut pending = self.pending.lock();
            if pending.closed.is_none() {
                pending.closed = Some(cause.to_string());
            }
            std::mem::take(&mut pending.handlers)
        };
        if !orphans.is_empty() {
            log::debug!("failing {} pending requests: {}", orphans.len(), cause);
        }
        drop(orphans);
        if let Err(err) = self.writer.lock().close() {
            log::debug!("close after fatal error: {}", err);
        }
    }

    fn register(&self, tag: u16, handler: Handler) -> Result<()> {
        let mut pending = self.pending.lock();
        if let Some(cause) = &pending.closed {
            return Err(Error::ConnectionClosed(cause.clone()));
        }
        pending.handlers.insert(tag, handler);
        Ok(())
    }

    fn unregister(&self, tag: u16) -> bool {
        self.pending.lock().handlers.remove(&tag).is_some()
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let msize = self.msize.load(Ordering::Acquire);
        let mut writer = self.writer.lock();
        log::trace!("-> {:?}", msg);
        msg.write_to(&mut **writer, msize)
    }
}

/// A multiplexed 9P client connection.
///
/// Every method may be called concurrently from any number of threads; each
/// call occupies one tag until its reply has been consumed.
pub struct Conn {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    version: String,
}

impl Conn {
    /// Start the reader thread and negotiate the protocol version.
    pub fn new<T: Transport>(transport: T, config: &ClientConfig) -> Result<Self> {
        let (reader, writer) = transport.split()?;
        let slots = config.concurrency.clamp(1, NO_TAG / 2);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            tags: TagPool::new(slots),
            flush_tags: TagPool::with_base(slots, slots),
            msize: AtomicU32::new(config.msize),
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("9p-client-reader".into())
                .spawn(move || read_loop(reader, shared))?
        };

        let mut conn = Conn {
            shared,
            reader: Mutex::new(Some(handle)),
            version: String::new(),
        };
        conn.negotiate(&config.version, config.msize)?;
        Ok(conn)
    }

    fn negotiate(&mut self, version: &str, msize: u32) -> Result<()> {
        let req = Tversion {
            msize,
            version: version.to_string(),
        };
        let reply: Rversion =
            self.exchange(&Context::background(), NO_TAG, req.into(), decoder::<Rversion>())?;
        if reply.version != version {
            log::warn!("RVERSION not accepted (req={}, resp={})", version, reply.version);
            return Err(Error::VersionRejected {
                wanted: version.to_string(),
                got: reply.version,
            });
        }
        if reply.msize > msize {
            return Err(Error::MsizeRaised {
                proposed: msize,
                got: reply.msize,
            });
        }
        if reply.msize < MIN_MSIZE {
            log::warn!("server msize {} is below {}", reply.msize, MIN_MSIZE);
        }
        self.shared.msize.store(reply.msize, Ordering::Release);
        self.version = reply.version;
        log::debug!("negotiated {} with msize {}", self.version, reply.msize);
        Ok(())
    }

    /// The negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.shared.msize.load(Ordering::Acquire)
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Largest read or write payload that fits in one message.
    pub fn max_io(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ)
    }

    pub fn tags(&self) -> &TagPool {
        &self.shared.tags
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().closed.is_some()
    }

    /// Send one request and wait for its reply under `ctx`.
    fn call<T>(
        &self,
        ctx: &Context,
        body: Body,
        decode: impl FnOnce(Header, &mut dyn Discard) -> Result<T> + Send + 'static,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let tag = self.shared.tags.acquire(ctx)?;
        let res = self.exchange(ctx, tag, body, decode);
        if let Err(err) = self.shared.tags.release(tag) {
            log::error!("{}", err);
        }
        res
    }

    /// The part of a call that runs while `tag` is held.
    fn exchange<T>(
        &self,
        ctx: &Context,
        tag: u16,
        body: Body,
        decode: impl FnOnce(Header, &mut dyn Discard) -> Result<T> + Send + 'static,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let on_reply = handler(move |header, body| {
            let res = match decode(header, body) {
                Err(err) if err.is_fatal() => Err(err),
                res => consumed(header, body).and(res),
            };
            match res {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                    Ok(())
                }
                Err(err) if err.is_fatal() => {
                    let _ = tx.send(Err(Error::ConnectionClosed(err.to_string())));
                    Err(err)
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                    Ok(())
                }
            }
        });
        self.shared.register(tag, on_reply)?;

        let msg = Message { tag, body };
        if let Err(err) = self.shared.send(&msg) {
            self.shared.unregister(tag);
            // An oversized message is refused before any byte is written.
            if matches!(err, Error::Io(_)) {
                log::error!("write failed: {}", err);
                self.shared.fail_all(&err);
            }
            return Err(err);
        }

        match ctx.recv(&rx) {
            Waited::Ready(res) => res,
            Waited::Disconnected => Err(self.shared.closed_error()),
            Waited::Interrupted(err) => {
                log::debug!("tag {} abandoned: {}", tag, err);
                self.flush(tag);
                // A reply that beat the Rflush has already been decoded.
                match rx.try_recv() {
                    Ok(res) => res,
                    Err(_) => Err(err),
                }
            }
        }
    }

    /// Cancel the request on `oldtag` and wait until the server confirms.
    ///
    /// After Rflush the server sends nothing more for `oldtag`. Its handler
    /// is dropped on the reader thread as the Rflush is decoded, so anything
    /// still arriving for `oldtag` is skipped, and the tag can be reused.
    fn flush(&self, oldtag: u16) {
        let ctx = Context::background();
        let shared = self.shared.clone();
        let decode = move |header: Header, body: &mut dyn Discard| {
            let res = decode_reply::<Rflush, _>(header.ty, body);
            shared.unregister(oldtag);
            res
        };
        let res = self.shared.flush_tags.acquire(&ctx).and_then(|tag| {
            let res = self.exchange(&ctx, tag, Tflush { oldtag }.into(), decode);
            if let Err(err) = self.shared.flush_tags.release(tag) {
                log::error!("{}", err);
            }
            res
        });
        if let Err(err) = res {
            log::debug!("flush of tag {} failed: {}", oldtag, err);
        }
        self.shared.unregister(oldtag);
    }

    pub fn auth(&self, ctx: &Context, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        let req = Tauth {
            afid,
            uname: uname.to_string(),
            aname: aname.to_string(),
        };
        let reply: Rauth = self.call(ctx, req.into(), decoder::<Rauth>())?;
        Ok(reply.aqid)
    }

    pub fn attach(&self, ctx: &Context, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        let req = Tattach {
            fid,
            afid,
            uname: uname.to_string(),
            aname: aname.to_string(),
        };
        let reply: Rattach = self.call(ctx, req.into(), decoder::<Rattach>())?;
        Ok(reply.qid)
    }

    /// Walk `names` from `fid`, binding the result to `newfid`.
    ///
    /// Fewer qids than names means the walk stopped early and `newfid` was
    /// not bound.
    pub fn walk(&self, ctx: &Context, fid: u32, newfid: u32, names: &[&str]) -> Result<Vec<Qid>> {
        let req = Twalk {
            fid,
            newfid,
            wnames: names.iter().map(|n| n.to_string()).collect(),
        };
        let reply: Rwalk = self.call(ctx, req.into(), decoder::<Rwalk>())?;
        Ok(reply.wqids)
    }

    /// Returns the file's qid and iounit.
    pub fn open(&self, ctx: &Context, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        let reply: Ropen = self.call(ctx, Topen { fid, mode }.into(), decoder::<Ropen>())?;
        Ok((reply.qid, reply.iounit))
    }

    pub fn create(&self, ctx: &Context, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        let req = Tcreate {
            fid,
            name: name.to_string(),
            perm,
            mode,
        };
        let reply: Rcreate = self.call(ctx, req.into(), decoder::<Rcreate>())?;
        Ok((reply.qid, reply.iounit))
    }

    /// Read into `buf` from `offset`.
    ///
    /// At most `buf.len()` bytes are requested and copied, however many the
    /// server claims to send.
    pub fn read(&self, ctx: &Context, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let cap = buf.len().min(self.max_io() as usize);
        let req = Tread {
            fid,
            offset,
            count: cap as u32,
        };
        let data = self.call(ctx, req.into(), move |header: Header, body: &mut dyn Discard| {
            match header.ty {
                MessageType::Rread => Rread::decode_bounded(body, cap),
                ty => decode_reply::<Rread, _>(ty, body).map(|r| r.data.0),
            }
        })?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Write one message's worth of `data`; returns the count the server took.
    pub fn write(&self, ctx: &Context, fid: u32, offset: u64, data: &[u8]) -> Result<usize> {
        let n = data.len().min(self.max_io() as usize);
        let req = Twrite {
            fid,
            offset,
            data: Data(data[..n].to_vec()),
        };
        let reply: Rwrite = self.call(ctx, req.into(), decoder::<Rwrite>())?;
        Ok(reply.count as usize)
    }

    pub fn clunk(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.call(ctx, Tclunk { fid }.into(), decoder::<Rclunk>())?;
        Ok(())
    }

    pub fn remove(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.call(ctx, Tremove { fid }.into(), decoder::<Rremove>())?;
        Ok(())
    }

    pub fn stat(&self, ctx: &Context, fid: u32) -> Result<Stat> {
        let reply: Rstat = self.call(ctx, Tstat { fid }.into(), decoder::<Rstat>())?;
        Ok(reply.stat)
    }

    pub fn wstat(&self, ctx: &Context, fid: u32, stat: &Stat) -> Result<()> {
        let req = Twstat {
            fid,
            stat: stat.clone(),
        };
        self.call(ctx, req.into(), decoder::<Rwstat>())?;
        Ok(())
    }

    /// Shut the stream down; pending and future calls fail.
    pub fn close(&self) {
        self.shared
            .fail_all(&Error::ConnectionClosed("closed by client".into()));
        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                log::error!("client reader thread panicked");
            }
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

fn handler<F>(f: F) -> Handler
where
    F: FnOnce(Header, &mut ReplyBody<'_>) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

fn decoder<P: Payload + Send + 'static>() -> impl FnOnce(Header, &mut dyn Discard) -> Result<P> + Send + 'static {
    |header: Header, body: &mut dyn Discard| decode_reply::<P, _>(header.ty, body)
}

/// Fail unless the payload used every byte its size field declared.
///
/// The leftover is drained first so the error names the real mismatch.
fn consumed(header: Header, body: &mut ReplyBody<'_>) -> Result<()> {
    let rest = body.limit();
    if rest == 0 {
        return Ok(());
    }
    body.discard(rest).map_err(|e| Error::short(e, "message"))?;
    Err(Error::SizeMismatch {
        declared: header.size,
        actual: header.size as u64 - rest,
    })
}

fn read_loop<R: Discard>(mut reader: R, shared: Arc<Shared>) {
    let cause = loop {
        let header = match Header::read(&mut reader) {
            Ok(header) => header,
            Err(err) => break err,
        };
        let msize = shared.msize.load(Ordering::Acquire);
        if header.size > msize {
            break Error::TooLarge {
                size: header.size as u64,
                msize,
            };
        }
        if header.ty.is_request() {
            break Error::UnknownType(header.ty as u8);
        }
        log::trace!("<- {} tag {} ({} bytes)", header.ty, header.tag, header.size);

        let handler = shared.pending.lock().handlers.remove(&header.tag);
        let mut body = Read::take(&mut reader as &mut dyn Discard, header.body_len());
        match handler {
            Some(handler) => {
                if let Err(err) = handler(header, &mut body) {
                    break err;
                }
            }
            None => {
                log::warn!("dropping {} for unknown tag {}", header.ty, header.tag);
                let rest = body.limit();
                if let Err(err) = body.discard(rest) {
                    break Error::short(err, "message");
                }
            }
        }
    };

    if shared.pending.lock().closed.is_none() {
        match cause {
            Error::Hangup => log::debug!("server hung up"),
            _ => log::error!("connection failed: {}", cause),
        }
    }
    shared.fail_all(&cause);
}
