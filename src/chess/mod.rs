//! Chess Rules Adapter
//!
//! Thin wrapper over `shakmaty` exposing exactly what the room engine needs:
//! apply a coordinate-shaped move against a position, report SAN and the
//! resulting FEN, and detect terminal conditions. The engine never touches
//! `shakmaty` types directly.

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::{CastlingMode, Chess, EnPassantMode, File, Move, Position, Role, Square};
use thiserror::Error;

use crate::room::{Color, PromotionPiece};

/// Rules-level rejection of a move or position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    /// The position encoding could not be parsed or is unreachable.
    #[error("invalid position encoding")]
    InvalidPosition,

    /// The move is not legal in the current position.
    #[error("illegal move")]
    IllegalMove,

    /// A pawn reached the last rank without a promotion piece selected.
    #[error("promotion piece required")]
    PromotionRequired,
}

/// Terminal condition reported by the rules after a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Side to move is checkmated.
    Checkmate,
    /// Side to move has no legal move and is not in check.
    Stalemate,
    /// Neither side can deliver mate.
    InsufficientMaterial,
    /// Fifty moves without a capture or pawn push.
    FiftyMoves,
}

/// Result of a successfully applied move.
#[derive(Debug, Clone)]
pub struct AppliedMove {
    /// Standard Algebraic Notation for the move, e.g. `Nf3`, `O-O`, `exd5`.
    pub san: String,
    /// FEN of the position after the move.
    pub fen_after: String,
    /// Side to move after the move.
    pub turn_after: Color,
    /// Terminal condition the move produced, if any.
    pub terminal: Option<TerminalKind>,
}

/// A chess position with rules evaluation.
///
/// Wraps a `shakmaty::Chess` and keeps all conversion between the wire's
/// coordinate vocabulary and the library's move representation in one place.
#[derive(Debug, Clone)]
pub struct Board {
    position: Chess,
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    /// Starting position.
    pub fn new() -> Self {
        Self {
            position: Chess::default(),
        }
    }

    /// Resume a position from FEN.
    pub fn from_fen(fen: &str) -> Result<Self, RulesError> {
        let parsed: Fen = fen.parse().map_err(|_| RulesError::InvalidPosition)?;
        let position = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|_| RulesError::InvalidPosition)?;
        Ok(Self { position })
    }

    /// FEN of the current position.
    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    /// Side to move.
    pub fn turn(&self) -> Color {
        color_from(self.position.turn())
    }

    /// Terminal condition of the current position, if any.
    pub fn terminal(&self) -> Option<TerminalKind> {
        if self.position.is_checkmate() {
            Some(TerminalKind::Checkmate)
        } else if self.position.is_stalemate() {
            Some(TerminalKind::Stalemate)
        } else if self.position.is_insufficient_material() {
            Some(TerminalKind::InsufficientMaterial)
        } else if self.position.halfmoves() >= 100 {
            Some(TerminalKind::FiftyMoves)
        } else {
            None
        }
    }

    /// Validate and apply a coordinate move (`e2` → `e4`, optional promotion).
    ///
    /// Castling is submitted as the king's two-square move (`e1` → `g1`).
    pub fn apply(
        &mut self,
        from: &str,
        to: &str,
        promotion: Option<PromotionPiece>,
    ) -> Result<AppliedMove, RulesError> {
        let from = parse_square(from)?;
        let to = parse_square(to)?;

        let legal = self.position.legal_moves();
        let candidates: Vec<&Move> = legal
            .iter()
            .filter(|m| match m {
                Move::Castle { king, rook } => {
                    *king == from && castle_king_target(*king, *rook) == to
                }
                _ => m.from() == Some(from) && m.to() == to,
            })
            .collect();

        if candidates.is_empty() {
            return Err(RulesError::IllegalMove);
        }

        let chosen = match promotion {
            Some(piece) => {
                let role = role_from(piece);
                *candidates
                    .iter()
                    .find(|m| m.promotion() == Some(role))
                    // Promotion supplied but the move does not promote.
                    .ok_or(RulesError::IllegalMove)?
            }
            None => {
                if candidates.iter().all(|m| m.promotion().is_some()) {
                    return Err(RulesError::PromotionRequired);
                }
                *candidates
                    .iter()
                    .find(|m| m.promotion().is_none())
                    .ok_or(RulesError::IllegalMove)?
            }
        };

        let san = San::from_move(&self.position, chosen).to_string();
        let next = self
            .position
            .clone()
            .play(chosen)
            .map_err(|_| RulesError::IllegalMove)?;
        self.position = next;

        Ok(AppliedMove {
            san,
            fen_after: self.fen(),
            turn_after: self.turn(),
            terminal: self.terminal(),
        })
    }
}

/// King destination square for a castling move (standard chess).
fn castle_king_target(king: Square, rook: Square) -> Square {
    let file = if rook.file() > king.file() {
        File::G
    } else {
        File::C
    };
    Square::from_coords(file, king.rank())
}

fn parse_square(s: &str) -> Result<Square, RulesError> {
    Square::from_ascii(s.as_bytes()).map_err(|_| RulesError::IllegalMove)
}

fn color_from(c: shakmaty::Color) -> Color {
    match c {
        shakmaty::Color::White => Color::White,
        shakmaty::Color::Black => Color::Black,
    }
}

fn role_from(piece: PromotionPiece) -> Role {
    match piece {
        PromotionPiece::Queen => Role::Queen,
        PromotionPiece::Rook => Role::Rook,
        PromotionPiece::Bishop => Role::Bishop,
        PromotionPiece::Knight => Role::Knight,
    }
}

/// Extract the fields of a FEN that identify a position for repetition
/// purposes: placement, side to move, castling rights, en-passant target.
/// Halfmove and fullmove counters are excluded.
pub fn repetition_key(fen: &str) -> &str {
    let mut splits = 0;
    for (i, c) in fen.char_indices() {
        if c == ' ' {
            splits += 1;
            if splits == 4 {
                return &fen[..i];
            }
        }
    }
    fen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_position_round_trip() {
        let board = Board::new();
        assert_eq!(
            board.fen(),
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"
        );
        assert_eq!(board.turn(), Color::White);
        assert!(board.terminal().is_none());
    }

    #[test]
    fn applies_a_simple_move() {
        let mut board = Board::new();
        let applied = board.apply("e2", "e4", None).unwrap();
        assert_eq!(applied.san, "e4");
        assert_eq!(applied.turn_after, Color::Black);
        assert!(applied.terminal.is_none());
        assert!(applied.fen_after.starts_with("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b"));
    }

    #[test]
    fn rejects_illegal_moves() {
        let mut board = Board::new();
        assert_eq!(board.apply("e2", "e5", None).unwrap_err(), RulesError::IllegalMove);
        assert_eq!(board.apply("e7", "e5", None).unwrap_err(), RulesError::IllegalMove);
        assert_eq!(board.apply("zz", "e4", None).unwrap_err(), RulesError::IllegalMove);
    }

    #[test]
    fn fools_mate_is_checkmate() {
        let mut board = Board::new();
        board.apply("f2", "f3", None).unwrap();
        board.apply("e7", "e5", None).unwrap();
        board.apply("g2", "g4", None).unwrap();
        let last = board.apply("d8", "h4", None).unwrap();
        assert_eq!(last.san, "Qh4#");
        assert_eq!(last.terminal, Some(TerminalKind::Checkmate));
    }

    #[test]
    fn castling_by_king_squares() {
        let mut board =
            Board::from_fen("r1bqk1nr/pppp1ppp/2n5/2b1p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4")
                .unwrap();
        let applied = board.apply("e1", "g1", None).unwrap();
        assert_eq!(applied.san, "O-O");
    }

    #[test]
    fn promotion_requires_a_piece() {
        let mut board = Board::from_fen("8/P6k/8/8/8/8/8/K7 w - - 0 1").unwrap();
        assert_eq!(
            board.apply("a7", "a8", None).unwrap_err(),
            RulesError::PromotionRequired
        );
        let applied = board.apply("a7", "a8", Some(PromotionPiece::Queen)).unwrap();
        assert_eq!(applied.san, "a8=Q");
    }

    #[test]
    fn promotion_on_non_promoting_move_is_illegal() {
        let mut board = Board::new();
        assert_eq!(
            board.apply("e2", "e4", Some(PromotionPiece::Queen)).unwrap_err(),
            RulesError::IllegalMove
        );
    }

    #[test]
    fn stalemate_detected() {
        let board = Board::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
        assert_eq!(board.terminal(), Some(TerminalKind::Stalemate));
    }

    #[test]
    fn insufficient_material_detected() {
        let board = Board::from_fen("8/8/4k3/8/8/4K3/8/8 w - - 0 1").unwrap();
        assert_eq!(board.terminal(), Some(TerminalKind::InsufficientMaterial));
    }

    #[test]
    fn repetition_key_strips_counters() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 3 7";
        assert_eq!(
            repetition_key(fen),
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -"
        );
    }
}
