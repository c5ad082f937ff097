use std::os::fd::OwnedFd;

use burrow_core::{Marshal, Mid};

use crate::error::{Error, Result};
use crate::messages::ErrorResp;
use crate::transport::{FrameTransport, MAX_DONATED_FDS};

/// Performs one request/response exchange over `transport`.
///
/// An error response comes back as [`Error::Remote`] with the peer's code
/// untouched.
pub(crate) async fn exchange<T, Req, Resp>(
    transport: &mut T,
    mid: Mid,
    req: &Req,
    donate: Vec<OwnedFd>,
) -> Result<(Resp, Vec<OwnedFd>)>
where
    T: FrameTransport,
    Req: Marshal,
    Resp: Marshal,
{
    if donate.len() > MAX_DONATED_FDS {
        return Err(Error::InvalidFrame(format!(
            "cannot donate {} descriptors, limit is {MAX_DONATED_FDS}",
            donate.len()
        )));
    }
    let size = req.size_bytes();
    let payload_len = u32::try_from(size).map_err(|_| Error::MessageTooLarge {
        size,
        max: u32::MAX,
    })?;

    transport.clear_donations();
    req.marshal_bytes(transport.payload_buf(payload_len))?;
    for fd in donate {
        transport.add_donation_fd(fd).map_err(Error::Remote)?;
    }
    transport.send_frame(mid, payload_len).await?;

    let (resp_mid, resp_len) = transport.recv_frame().await?;
    let fds = transport.take_received_fds();
    let payload = transport.payload_buf(resp_len);
    if resp_mid == Mid::ERROR {
        let resp = ErrorResp::unmarshal_bytes(payload)?;
        return Err(Error::Remote(resp.errno));
    }
    if resp_mid != mid {
        return Err(Error::InvalidFrame(format!(
            "response {resp_mid} does not answer request {mid}"
        )));
    }
    Ok((Resp::unmarshal_bytes(payload)?, fds))
}
