/// Derive the [`Packet`](crate::Packet) impl of a type that implements
/// [`AckPacket`](crate::AckPacket).
///
/// The generated payload starts with the 4-byte correlation key, followed by the
/// to-server or to-client shape chosen by the packet's current destination.
///
/// ```rust,ignore
/// impl AckPacket for CounterPacket { /* key, destination, both shapes */ }
/// packetline_codec::ack_packet!(CounterPacket);
/// ```
#[macro_export]
macro_rules! ack_packet {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Packet for $ty {
                fn payload_size(&self) -> usize {
                    $crate::packet::ack_payload_size(self)
                }

                fn write_payload(
                    &self,
                    out: &mut $crate::PayloadWriter<'_>,
                ) -> $crate::Result<()> {
                    $crate::packet::write_ack_payload(self, out)
                }

                fn read_payload(
                    &mut self,
                    input: &mut $crate::PayloadReader,
                ) -> $crate::Result<()> {
                    $crate::packet::read_ack_payload(self, input)
                }

                fn as_ack(&self) -> ::std::option::Option<&dyn $crate::AckPacket> {
                    ::std::option::Option::Some(self)
                }

                fn as_ack_mut(
                    &mut self,
                ) -> ::std::option::Option<&mut dyn $crate::AckPacket> {
                    ::std::option::Option::Some(self)
                }
            }
        )+
    };
}
