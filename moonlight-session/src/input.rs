//! Encrypted input-send pipeline, grounded in `InputStream.c`.
//!
//! Packets are built in the NVIDIA wire layout (network/big-endian byte
//! order, matching the original's `htonl`/`htons` calls), queued, batched at
//! drain time, encrypted, and framed with a 4-byte big-endian length prefix.

use std::time::Duration;

use crate::bytebuffer::{ByteOrder, ByteWriter};
use crate::crypto::{CbcContext, GcmContext};
use crate::queue::BoundedQueue;

const MAX_INPUT_PACKET_SIZE: usize = 128;
const INPUT_QUEUE_CAPACITY: usize = 30;

const PACKET_TYPE_MOUSE_BUTTON: i32 = 0x05;
const PACKET_TYPE_HAPTICS: i32 = 0x06;
const PACKET_TYPE_MOUSE_MOVE: i32 = 0x08;
const PACKET_TYPE_KEYBOARD: i32 = 0x0A;
const PACKET_TYPE_SCROLL: i32 = 0x0A;
const PACKET_TYPE_CONTROLLER: i32 = 0x18;
const PACKET_TYPE_MULTI_CONTROLLER: i32 = 0x1E;

const MOUSE_MOVE_MAGIC: i32 = 0x06;
const C_HEADER_A: i32 = 0x0000000A;
const C_HEADER_B: i16 = 0x1400;
const C_TAIL_A: i32 = 0x0000009C;
const C_TAIL_B: i16 = 0x0055;
const MC_HEADER_A: i32 = 0x0000000D;
const MC_HEADER_B: i16 = 0x001A;
const MC_MID_B: i16 = 0x0014;
const MC_TAIL_A: i32 = 0x0000009C;
const MC_TAIL_B: i16 = 0x0055;
const SCROLL_MAGIC_A: i8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    fn wire_value(self) -> i32 {
        match self {
            MouseButton::Left => 1,
            MouseButton::Middle => 2,
            MouseButton::Right => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Press,
    Release,
}

impl ButtonAction {
    fn wire_value(self) -> i8 {
        match self {
            ButtonAction::Press => 0x07,
            ButtonAction::Release => 0x08,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InputPacket {
    MouseMove { delta_x: i16, delta_y: i16 },
    MouseButton { action: ButtonAction, button: MouseButton },
    Keyboard { key_action: i8, key_code: i16, modifiers: i8 },
    Controller {
        button_flags: i16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    },
    MultiController {
        controller_number: i16,
        active_gamepad_mask: i16,
        button_flags: i16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    },
    Scroll { amount: i16 },
}

impl InputPacket {
    fn wire_type(&self) -> i32 {
        match self {
            InputPacket::MouseMove { .. } => PACKET_TYPE_MOUSE_MOVE,
            InputPacket::MouseButton { .. } => PACKET_TYPE_MOUSE_BUTTON,
            InputPacket::Keyboard { .. } => PACKET_TYPE_KEYBOARD,
            InputPacket::Controller { .. } => PACKET_TYPE_CONTROLLER,
            InputPacket::MultiController { .. } => PACKET_TYPE_MULTI_CONTROLLER,
            InputPacket::Scroll { .. } => PACKET_TYPE_SCROLL,
        }
    }

    /// Serializes to the wire layout (big-endian, matching the original's network byte order).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(MAX_INPUT_PACKET_SIZE, ByteOrder::Big);
        w.put_u32(self.wire_type() as u32);
        match *self {
            InputPacket::MouseMove { delta_x, delta_y } => {
                w.put_u32(MOUSE_MOVE_MAGIC as u32);
                w.put_u16(delta_x as u16);
                w.put_u16(delta_y as u16);
            }
            InputPacket::MouseButton { action, button } => {
                w.put_u8(action.wire_value() as u8);
                w.put_u32(button.wire_value() as u32);
            }
            InputPacket::Keyboard {
                key_action,
                key_code,
                modifiers,
            } => {
                w.put_u8(key_action as u8);
                w.put_u32(0);
                w.put_u16(key_code as u16);
                w.put_u8(modifiers as u8);
                w.put_u16(0);
            }
            InputPacket::Controller {
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            } => {
                w.put_u32(C_HEADER_A as u32);
                w.put_u16(C_HEADER_B as u16);
                w.put_u16(button_flags as u16);
                w.put_u8(left_trigger);
                w.put_u8(right_trigger);
                w.put_u16(left_stick_x as u16);
                w.put_u16(left_stick_y as u16);
                w.put_u16(right_stick_x as u16);
                w.put_u16(right_stick_y as u16);
                w.put_u32(C_TAIL_A as u32);
                w.put_u16(C_TAIL_B as u16);
            }
            InputPacket::MultiController {
                controller_number,
                active_gamepad_mask,
                button_flags,
                left_trigger,
                right_trigger,
                left_stick_x,
                left_stick_y,
                right_stick_x,
                right_stick_y,
            } => {
                w.put_u32(MC_HEADER_A as u32);
                w.put_u16(MC_HEADER_B as u16);
                w.put_u16(controller_number as u16);
                w.put_u16(active_gamepad_mask as u16);
                w.put_u16(MC_MID_B as u16);
                w.put_u16(button_flags as u16);
                w.put_u8(left_trigger);
                w.put_u8(right_trigger);
                w.put_u16(left_stick_x as u16);
                w.put_u16(left_stick_y as u16);
                w.put_u16(right_stick_x as u16);
                w.put_u16(right_stick_y as u16);
                w.put_u32(MC_TAIL_A as u32);
                w.put_u16(MC_TAIL_B as u16);
            }
            InputPacket::Scroll { amount } => {
                w.put_u8(SCROLL_MAGIC_A as u8);
                w.put_u8(0);
                w.put_u16(0);
                w.put_u16(amount as u16);
                w.put_u16(amount as u16);
                w.put_u16(0);
            }
        }
        w.into_vec()
    }
}

/// Attempts to absorb `next` into `batch`, returning `true` if it was consumed.
fn try_batch(batch: &mut InputPacket, next: &InputPacket, dirs: &mut [i8; 6]) -> bool {
    match (batch, next) {
        (
            InputPacket::MultiController {
                controller_number: cn,
                button_flags: bf,
                left_trigger: lt,
                right_trigger: rt,
                left_stick_x: lx,
                left_stick_y: ly,
                right_stick_x: rx,
                right_stick_y: ry,
                ..
            },
            InputPacket::MultiController {
                controller_number: ncn,
                button_flags: nbf,
                left_trigger: nlt,
                right_trigger: nrt,
                left_stick_x: nlx,
                left_stick_y: nly,
                right_stick_x: nrx,
                right_stick_y: nry,
                ..
            },
        ) => {
            if cn != ncn || bf != nbf {
                return false;
            }
            let checks = [
                check_dir(*lt as i16, *nlt as i16, &mut dirs[0]),
                check_dir(*rt as i16, *nrt as i16, &mut dirs[1]),
                check_dir(*lx, *nlx, &mut dirs[2]),
                check_dir(*ly, *nly, &mut dirs[3]),
                check_dir(*rx, *nrx, &mut dirs[4]),
                check_dir(*ry, *nry, &mut dirs[5]),
            ];
            if checks.iter().any(|ok| !ok) {
                return false;
            }
            *lt = *nlt;
            *rt = *nrt;
            *lx = *nlx;
            *ly = *nly;
            *rx = *nrx;
            *ry = *nry;
            true
        }
        (
            InputPacket::MouseMove { delta_x, delta_y },
            InputPacket::MouseMove {
                delta_x: ndx,
                delta_y: ndy,
            },
        ) => {
            let total_x = *delta_x as i32 + *ndx as i32;
            let total_y = *delta_y as i32 + *ndy as i32;
            if !(i16::MIN as i32..=i16::MAX as i32).contains(&total_x)
                || !(i16::MIN as i32..=i16::MAX as i32).contains(&total_y)
            {
                return false;
            }
            *delta_x = total_x as i16;
            *delta_y = total_y as i16;
            true
        }
        _ => false,
    }
}

/// Direction-consistency check for multi-controller axis batching: a value that holds steady
/// is always fine, a zero terminates batching (so centre-release isn't absorbed away), and a
/// moving value must keep moving the same direction as the first divergence observed.
fn check_dir(current: i16, new: i16, dir: &mut i8) -> bool {
    if current == new {
        return true;
    }
    if new == 0 {
        return false;
    }
    if *dir == 0 {
        *dir = if new < current { -1 } else { 1 };
        true
    } else if *dir == -1 {
        new < current
    } else {
        new >= current
    }
}

enum CipherMode {
    Cbc(CbcContext),
    Gcm { ctx: GcmContext, current_iv: [u8; 16] },
}

/// Drains the input queue, batches compatible packets, encrypts, and frames them for
/// transmission. Owns no socket; `take_framed_message` hands the caller a ready-to-send buffer.
pub struct InputStream {
    queue: BoundedQueue<InputPacket>,
    cipher: CipherMode,
    send_on_control_stream: bool,
}

impl InputStream {
    pub fn new(key: [u8; 16], iv: [u8; 16], use_gcm: bool, send_on_control_stream: bool) -> Self {
        let cipher = if use_gcm {
            CipherMode::Gcm {
                ctx: GcmContext::new(key),
                current_iv: iv,
            }
        } else {
            CipherMode::Cbc(CbcContext::new(key, iv))
        };
        Self {
            queue: BoundedQueue::new(INPUT_QUEUE_CAPACITY),
            cipher,
            send_on_control_stream,
        }
    }

    pub fn enqueue(&mut self, packet: InputPacket) -> bool {
        self.queue.offer(packet).is_ok()
    }

    pub fn wait_for_packet(&self) -> Option<InputPacket> {
        self.queue.wait().ok()
    }

    pub fn wait_for_packet_timeout(&self, timeout: Duration) -> Option<InputPacket> {
        self.queue.wait_timeout(timeout).ok().flatten()
    }

    /// Peeks the queue and absorbs every immediately-following batchable packet into `head`.
    pub fn drain_batch(&self, mut head: InputPacket) -> InputPacket {
        let mut dirs = [0i8; 6];
        loop {
            let Some(next) = self.queue.peek() else { break };
            let cloned = clone_for_peek(&next);
            if !try_batch(&mut head, &cloned, &mut dirs) {
                break;
            }
            self.queue.poll();
        }
        head
    }

    /// Encrypts and frames one packet, mutating the chained cipher state as a side effect.
    pub fn encrypt_and_frame(&mut self, packet: &InputPacket) -> Vec<u8> {
        let plaintext = packet.encode();
        let ciphertext = match &mut self.cipher {
            CipherMode::Cbc(ctx) => ctx.encrypt(&plaintext, true),
            CipherMode::Gcm { ctx, current_iv } => {
                let framed = ctx
                    .encrypt_with_iv(current_iv, &plaintext)
                    .expect("gcm encryption with a valid 16-byte key cannot fail");
                if framed.len() >= 16 + current_iv.len() {
                    current_iv.copy_from_slice(&framed[framed.len() - current_iv.len()..]);
                }
                framed
            }
        };

        let mut framed = ByteWriter::with_capacity(4 + ciphertext.len(), ByteOrder::Big);
        framed.put_u32(ciphertext.len() as u32);
        framed.put_bytes(&ciphertext);
        framed.into_vec()
    }

    pub fn send_on_control_stream(&self) -> bool {
        self.send_on_control_stream
    }
}

fn clone_for_peek(packet: &InputPacket) -> InputPacket {
    packet.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_move_batches_three_deltas_into_one() {
        let mut stream = InputStream::new([0; 16], [0; 16], false, false);
        stream.enqueue(InputPacket::MouseMove { delta_x: 3, delta_y: 2 });
        stream.enqueue(InputPacket::MouseMove { delta_x: 1, delta_y: 1 });

        let head = InputPacket::MouseMove { delta_x: 5, delta_y: 10 };
        let batched = stream.drain_batch(head);
        match batched {
            InputPacket::MouseMove { delta_x, delta_y } => {
                assert_eq!(delta_x, 9);
                assert_eq!(delta_y, 13);
            }
            _ => panic!("expected mouse move"),
        }
        assert!(stream.queue.is_empty());
    }

    #[test]
    fn zero_axis_terminates_batching() {
        let mut stream = InputStream::new([0; 16], [0; 16], false, false);
        stream.enqueue(InputPacket::MultiController {
            controller_number: 0,
            active_gamepad_mask: 1,
            button_flags: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 0,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        });

        let head = InputPacket::MultiController {
            controller_number: 0,
            active_gamepad_mask: 1,
            button_flags: 0,
            left_trigger: 0,
            right_trigger: 0,
            left_stick_x: 100,
            left_stick_y: 0,
            right_stick_x: 0,
            right_stick_y: 0,
        };
        let batched = stream.drain_batch(head);
        match batched {
            InputPacket::MultiController { left_stick_x, .. } => assert_eq!(left_stick_x, 100),
            _ => panic!("expected multi-controller"),
        }
        // The zero-axis packet terminates batching rather than being absorbed, so it stays queued.
        assert!(!stream.queue.is_empty());
    }

    #[test]
    fn cbc_length_prefix_is_big_endian() {
        let mut stream = InputStream::new([1; 16], [2; 16], false, false);
        let framed = stream.encrypt_and_frame(&InputPacket::MouseMove { delta_x: 1, delta_y: 1 });
        let len = u32::from_be_bytes(framed[0..4].try_into().unwrap());
        assert_eq!(len as usize, framed.len() - 4);
    }

    #[test]
    fn gcm_chains_iv_through_current_iv_field() {
        let mut stream = InputStream::new([3; 16], [4; 16], true, true);
        let first = stream.encrypt_and_frame(&InputPacket::MouseMove { delta_x: 1, delta_y: 1 });
        let CipherMode::Gcm { current_iv, .. } = &stream.cipher else {
            panic!("expected gcm mode");
        };
        let tail: [u8; 16] = first[first.len() - 16..].try_into().unwrap();
        assert_eq!(*current_iv, tail);
    }
}
