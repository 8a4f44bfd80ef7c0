use bytes::Bytes;

/// Transport-neutral websocket frame.
///
/// Transports convert their native frame representation into/from `WsFrame`; everything above
/// the transport only ever sees this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl WsFrame {
    /// Text frame from an owned string (always valid UTF-8).
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: Bytes) -> Self {
        Self::Close(Some(WsCloseFrame { code, reason }))
    }

    /// Payload of data frames; control frames carry no application data.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            WsFrame::Text(bytes) | WsFrame::Binary(bytes) => Some(bytes.as_ref()),
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => None,
        }
    }

    /// Human-readable close reason, if this is a close frame.
    pub fn close_reason(&self) -> Option<String> {
        let WsFrame::Close(frame) = self else {
            return None;
        };
        Some(
            frame
                .as_ref()
                .map(|f| {
                    format!(
                        "code={} reason={}",
                        f.code,
                        String::from_utf8_lossy(f.reason.as_ref())
                    )
                })
                .unwrap_or_else(|| "remote closed".to_string()),
        )
    }
}
