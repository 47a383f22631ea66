pub(crate) mod provided;
pub(crate) mod send_copy;

pub(crate) use provided::ProvidedBufRing;
pub(crate) use send_copy::SendCopyPool;
