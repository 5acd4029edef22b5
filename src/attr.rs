//! STUN/TURN attribute set and codec helpers shared by the whole crate.

use bytecodec::{DecodeExt, EncodeExt};
use stun_codec::rfc5389::attributes::{
    AlternateServer, ErrorCode, Fingerprint, MappedAddress, MessageIntegrity, Nonce, Realm,
    Software, UnknownAttributes, Username, XorMappedAddress,
};
use stun_codec::rfc5766::attributes::{
    ChannelNumber, Data, DontFragment, EvenPort, Lifetime, RequestedTransport, ReservationToken,
    XorPeerAddress, XorRelayAddress,
};
use stun_codec::{Message, MessageDecoder, MessageEncoder};

use crate::Error;

stun_codec::define_attribute_enums!(
    Attribute,
    AttributeDecoder,
    AttributeEncoder,
    [
        MappedAddress,
        Username,
        MessageIntegrity,
        ErrorCode,
        UnknownAttributes,
        Realm,
        Nonce,
        XorMappedAddress,
        Software,
        AlternateServer,
        Fingerprint,
        ChannelNumber,
        Lifetime,
        XorPeerAddress,
        Data,
        XorRelayAddress,
        EvenPort,
        RequestedTransport,
        DontFragment,
        ReservationToken
    ]
);

pub(crate) fn encode(message: Message<Attribute>) -> Result<Vec<u8>, Error> {
    Ok(MessageEncoder::default().encode_into_bytes(message)?)
}

pub(crate) fn decode(datagram: &[u8]) -> Result<Message<Attribute>, Error> {
    MessageDecoder::<Attribute>::default()
        .decode_from_bytes(datagram)?
        .map_err(|broken| {
            tracing::debug!(?broken, "undecodable STUN message");
            Error::MalformedMessage
        })
}

/// Extracts the ERROR-CODE attribute as `(code, reason)`, if present.
pub(crate) fn error_code(message: &Message<Attribute>) -> Option<(u16, String)> {
    let error = message.get_attribute::<ErrorCode>()?;
    Some((error.code(), error.reason_phrase().to_owned()))
}
