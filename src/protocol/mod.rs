pub mod codec;
pub mod command;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use codec::PacketCodec;
pub use command::ClientCommand;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket, Greeting,
    HandshakeResponse, OkPacket,
};
pub use packet::{capabilities, Command, Packet, SEQ_NO_PRIOR_PACKET};
